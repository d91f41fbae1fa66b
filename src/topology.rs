// ABOUTME: In-memory replication topology graph built from probe results
// ABOUTME: Keeps parent edges acyclic and evicts stale nodes, orphaning their replicas as new roots

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::MonitorError;
use crate::probe::{NodeAddr, NodeRole, ProbeResult};

/// A tracked database node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    pub addr: NodeAddr,
    /// `None` until the node reports its role, unless it hangs off a parent.
    pub role: Option<NodeRole>,
    pub parent: Option<NodeAddr>,
    /// False while the node is known only because an upstream reported it.
    pub probed: bool,
    pub last_success_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
struct NodeEntry {
    addr: NodeAddr,
    reported_role: Option<NodeRole>,
    parent: Option<NodeAddr>,
    children: BTreeSet<NodeAddr>,
    probed: bool,
    discovered_ms: u64,
    last_success_ms: Option<u64>,
}

impl NodeEntry {
    fn new(addr: NodeAddr, discovered_ms: u64) -> Self {
        Self {
            addr,
            reported_role: None,
            parent: None,
            children: BTreeSet::new(),
            probed: false,
            discovered_ms,
            last_success_ms: None,
        }
    }

    fn role(&self) -> Option<NodeRole> {
        match (self.reported_role, &self.parent) {
            (Some(role), _) => Some(role),
            (None, Some(_)) => Some(NodeRole::Replica),
            (None, None) => None,
        }
    }

    /// Roots order: primaries, nodes not yet probed, orphaned replicas.
    fn root_rank(&self) -> u8 {
        match self.role() {
            Some(NodeRole::Primary) => 0,
            None => 1,
            Some(NodeRole::Replica) => 2,
        }
    }

    fn to_node(&self) -> Node {
        Node {
            addr: self.addr.clone(),
            role: self.role(),
            parent: self.parent.clone(),
            probed: self.probed,
            last_success_ms: self.last_success_ms,
        }
    }

    /// Timestamp staleness is measured from.
    fn freshness_ms(&self) -> u64 {
        self.last_success_ms.unwrap_or(self.discovered_ms)
    }
}

/// Outcome of one `ingest` call.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct IngestReport {
    /// Children that were not known before this result.
    pub discovered: Vec<NodeAddr>,
    /// Edges refused because they would have closed a cycle.
    pub anomalies: Vec<MonitorError>,
}

/// Directed replication graph: every node has at most one parent and no node
/// is its own ancestor.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TopologyGraph {
    entries: BTreeMap<NodeAddr, NodeEntry>,
}

impl TopologyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register configured nodes so the first cycle has something to probe.
    pub fn seed<I>(&mut self, addrs: I, now_ms: u64)
    where
        I: IntoIterator<Item = NodeAddr>,
    {
        for addr in addrs {
            self.entries
                .entry(addr.clone())
                .or_insert_with(|| NodeEntry::new(addr, now_ms));
        }
    }

    pub fn ingest(&mut self, result: &ProbeResult) -> IngestReport {
        let mut report = IngestReport::default();
        let origin = result.node.clone();

        let entry = self
            .entries
            .entry(origin.clone())
            .or_insert_with(|| NodeEntry::new(origin.clone(), result.timestamp_ms));

        if !result.reachable {
            // A failed probe says nothing about edges.
            return report;
        }

        entry.probed = true;
        if let Some(role) = result.role {
            entry.reported_role = Some(role);
        }
        entry.last_success_ms = Some(
            entry
                .last_success_ms
                .map_or(result.timestamp_ms, |prev| prev.max(result.timestamp_ms)),
        );

        // Detach former children this node no longer reports.
        let dropped: Vec<NodeAddr> = entry
            .children
            .iter()
            .filter(|child| !result.children.contains(*child))
            .cloned()
            .collect();
        for child in dropped {
            debug!(parent = %origin, child = %child, "replica no longer attached");
            self.detach(&child);
        }

        for child in &result.children {
            if !self.entries.contains_key(child) {
                self.entries.insert(
                    child.clone(),
                    NodeEntry::new(child.clone(), result.timestamp_ms),
                );
                report.discovered.push(child.clone());
                info!(parent = %origin, node = %child, "discovered replica");
            }

            if self.would_cycle(&origin, child) {
                let anomaly = MonitorError::TopologyCycleDetected {
                    parent: origin.clone(),
                    child: child.clone(),
                };
                warn!("{}; edge rejected", anomaly);
                report.anomalies.push(anomaly);
                continue;
            }

            self.attach(&origin, child);
        }

        report
    }

    /// True if making `parent` the upstream of `child` would make some node
    /// its own ancestor.
    fn would_cycle(&self, parent: &NodeAddr, child: &NodeAddr) -> bool {
        if parent == child {
            return true;
        }
        self.ancestors(parent).any(|ancestor| ancestor == child)
    }

    fn attach(&mut self, parent: &NodeAddr, child: &NodeAddr) {
        let previous = self.entries.get(child).and_then(|e| e.parent.clone());
        if previous.as_ref() == Some(parent) {
            return;
        }
        if let Some(old) = previous {
            info!(node = %child, from = %old, to = %parent, "replica changed upstream");
            if let Some(old_entry) = self.entries.get_mut(&old) {
                old_entry.children.remove(child);
            }
        }
        if let Some(child_entry) = self.entries.get_mut(child) {
            child_entry.parent = Some(parent.clone());
        }
        if let Some(parent_entry) = self.entries.get_mut(parent) {
            parent_entry.children.insert(child.clone());
        }
    }

    fn detach(&mut self, child: &NodeAddr) {
        let Some(parent) = self.entries.get_mut(child).and_then(|e| e.parent.take()) else {
            return;
        };
        if let Some(parent_entry) = self.entries.get_mut(&parent) {
            parent_entry.children.remove(child);
        }
    }

    /// Remove nodes whose last successful probe (or discovery, if never
    /// probed) is older than `stale_after`. Their replicas become roots.
    pub fn prune(&mut self, now_ms: u64, stale_after: Duration) -> Vec<NodeAddr> {
        let cutoff = now_ms.saturating_sub(stale_after.as_millis() as u64);
        let stale: Vec<NodeAddr> = self
            .entries
            .values()
            .filter(|e| e.freshness_ms() < cutoff)
            .map(|e| e.addr.clone())
            .collect();

        for addr in &stale {
            let Some(entry) = self.entries.remove(addr) else {
                continue;
            };
            if let Some(parent) = &entry.parent {
                if let Some(parent_entry) = self.entries.get_mut(parent) {
                    parent_entry.children.remove(addr);
                }
            }
            for child in &entry.children {
                if let Some(child_entry) = self.entries.get_mut(child) {
                    child_entry.parent = None;
                    info!(node = %child, former_parent = %addr, "replica orphaned; now a root");
                }
            }
            info!(node = %addr, "evicted stale node");
        }

        stale
    }

    /// Nodes in render order: roots (primaries first), then breadth-first
    /// over replicas. Siblings are ordered by address.
    pub fn nodes(&self) -> Nodes<'_> {
        let mut roots: Vec<&NodeEntry> = self
            .entries
            .values()
            .filter(|e| e.parent.is_none())
            .collect();
        roots.sort_by(|a, b| {
            a.root_rank()
                .cmp(&b.root_rank())
                .then_with(|| a.addr.cmp(&b.addr))
        });

        Nodes {
            graph: self,
            queue: roots.into_iter().map(|e| &e.addr).collect(),
        }
    }

    /// Addresses of every tracked node, in `nodes()` order.
    pub fn addrs(&self) -> Vec<NodeAddr> {
        self.nodes().map(|n| n.addr).collect()
    }

    pub fn get(&self, addr: &NodeAddr) -> Option<Node> {
        self.entries.get(addr).map(NodeEntry::to_node)
    }

    pub fn contains(&self, addr: &NodeAddr) -> bool {
        self.entries.contains_key(addr)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn children_of(&self, addr: &NodeAddr) -> impl Iterator<Item = &NodeAddr> {
        self.entries
            .get(addr)
            .into_iter()
            .flat_map(|e| e.children.iter())
    }

    /// Upstream chain of `addr`, nearest first.
    pub fn ancestors<'a>(&'a self, addr: &NodeAddr) -> impl Iterator<Item = &'a NodeAddr> + 'a {
        let mut next = self.entries.get(addr).and_then(|e| e.parent.as_ref());
        let limit = self.entries.len();
        let mut steps = 0;
        std::iter::from_fn(move || {
            // The bound only matters if the acyclic invariant were broken.
            if steps > limit {
                return None;
            }
            steps += 1;
            let current = next?;
            next = self.entries.get(current).and_then(|e| e.parent.as_ref());
            Some(current)
        })
    }

    /// Depth of `addr` below its root (roots are depth 0).
    pub fn depth(&self, addr: &NodeAddr) -> usize {
        self.ancestors(addr).count()
    }
}

/// Lazy breadth-first walk over a `TopologyGraph`.
pub struct Nodes<'a> {
    graph: &'a TopologyGraph,
    queue: VecDeque<&'a NodeAddr>,
}

impl Iterator for Nodes<'_> {
    type Item = Node;

    fn next(&mut self) -> Option<Self::Item> {
        let addr = self.queue.pop_front()?;
        let entry = self.graph.entries.get(addr)?;
        self.queue.extend(entry.children.iter());
        Some(entry.to_node())
    }
}
