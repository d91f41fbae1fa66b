// ABOUTME: Plain-text rendering of the replication topology
// ABOUTME: Draws the primary/replica tree with lag, trend and alert level per node

use std::fmt::Write;

use crate::lag::LagTrend;
use crate::scheduler::NodeStatus;

/// Render nodes (in topology order) as an indented tree.
pub fn render_tree(nodes: &[NodeStatus]) -> String {
    let mut out = String::from("Replication Topology:\n");
    if nodes.is_empty() {
        out.push_str("  (no nodes)\n");
        return out;
    }

    // Nodes arrive breadth-first; re-walk depth-first so each replica prints
    // under its upstream.
    let roots = nodes.iter().filter(|n| n.node.parent.is_none());
    for root in roots {
        render_subtree(&mut out, nodes, root, 0);
    }
    out
}

fn render_subtree(out: &mut String, nodes: &[NodeStatus], status: &NodeStatus, level: usize) {
    let indent = if level == 0 {
        String::new()
    } else {
        format!("{}└─ ", "   ".repeat(level - 1))
    };

    let role = match status.node.role {
        Some(role) => role.to_string(),
        None => "unknown".to_string(),
    };
    let _ = write!(
        out,
        "{}{} {} [{}]",
        indent, role, status.node.addr, status.severity
    );
    match status.lag_seconds {
        Some(lag) => {
            let _ = write!(out, " lag {:.1}s", lag);
        }
        None => out.push_str(" lag n/a"),
    }
    if let LagTrend::Slope { per_second, .. } = status.trend {
        let _ = write!(out, " ({:+.2}s/s)", per_second);
    }
    if !status.node.probed {
        out.push_str(" (not yet probed)");
    }
    out.push('\n');

    for child in nodes
        .iter()
        .filter(|n| n.node.parent.as_ref() == Some(&status.node.addr))
    {
        render_subtree(out, nodes, child, level + 1);
    }
}
