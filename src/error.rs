// ABOUTME: Custom error types for the topology monitor
// ABOUTME: Provides context-specific error variants with actionable messages

use std::fmt;

use crate::probe::NodeAddr;

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorError {
    /// Network or timeout failure while probing a node. Recorded in the
    /// probe result, never escalated past the scheduler.
    ProbeUnreachable { node: NodeAddr, reason: String },
    /// A lag sample arrived with a timestamp earlier than the last accepted one.
    OutOfOrderSample {
        node: NodeAddr,
        last_ms: u64,
        got_ms: u64,
    },
    /// Applying a parent edge would make `child` its own ancestor.
    TopologyCycleDetected { parent: NodeAddr, child: NodeAddr },
    ConfigurationInvalid(String),
    /// Unrecoverable scheduler fault, e.g. the concurrency budget was closed.
    Scheduler(String),
}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MonitorError::ProbeUnreachable { node, reason } => {
                write!(f, "Node {} unreachable: {}", node, reason)
            }
            MonitorError::OutOfOrderSample {
                node,
                last_ms,
                got_ms,
            } => write!(
                f,
                "Out-of-order lag sample for {}: got timestamp {} but last accepted is {}",
                node, got_ms, last_ms
            ),
            MonitorError::TopologyCycleDetected { parent, child } => write!(
                f,
                "Topology cycle detected: edge {} -> {} would make {} its own ancestor",
                parent, child, child
            ),
            MonitorError::ConfigurationInvalid(msg) => {
                write!(f, "Invalid configuration: {}", msg)
            }
            MonitorError::Scheduler(msg) => write!(f, "Scheduler error: {}", msg),
        }
    }
}

impl std::error::Error for MonitorError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_mentions_both_ends_of_cycle() {
        let err = MonitorError::TopologyCycleDetected {
            parent: NodeAddr::new("db-2", 5432),
            child: NodeAddr::new("db-1", 5432),
        };
        let msg = err.to_string();
        assert!(msg.contains("db-2:5432 -> db-1:5432"));
    }

    #[test]
    fn test_configuration_error_message() {
        let err = MonitorError::ConfigurationInvalid("critical <= warning".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid configuration: critical <= warning"
        );
    }
}
