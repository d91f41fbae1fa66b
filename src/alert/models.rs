// ABOUTME: Data structures for alert severities and transition events
// ABOUTME: These are serialized to JSON for webhook delivery

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::probe::NodeAddr;

/// Alert level of a node. `Unknown` means the last probe failed and is kept
/// apart from the lag-based levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Ok,
    Warning,
    Critical,
    Unknown,
}

impl Severity {
    /// Rank among lag-based levels; `None` for `Unknown`.
    pub fn rank(self) -> Option<u8> {
        match self {
            Severity::Ok => Some(0),
            Severity::Warning => Some(1),
            Severity::Critical => Some(2),
            Severity::Unknown => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Severity::Ok => "ok",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
            Severity::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub node: NodeAddr,
    pub from: Severity,
    pub to: Severity,
    pub timestamp_ms: u64,
    /// Lag of the sample that triggered the transition; absent for `Unknown`.
    pub lag_seconds: Option<f64>,
}

impl AlertEvent {
    /// True when the node got worse or stopped answering.
    pub fn is_escalation(&self) -> bool {
        match (self.from.rank(), self.to.rank()) {
            (Some(from), Some(to)) => to > from,
            (_, None) => true,
            (None, Some(_)) => false,
        }
    }
}

impl fmt::Display for AlertEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {} -> {}", self.node, self.from, self.to)?;
        if let Some(lag) = self.lag_seconds {
            write!(f, " (lag {:.1}s)", lag)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(from: Severity, to: Severity) -> AlertEvent {
        AlertEvent {
            node: NodeAddr::new("replica-1", 5432),
            from,
            to,
            timestamp_ms: 0,
            lag_seconds: Some(7.0),
        }
    }

    #[test]
    fn test_escalation_direction() {
        assert!(event(Severity::Ok, Severity::Warning).is_escalation());
        assert!(event(Severity::Warning, Severity::Unknown).is_escalation());
        assert!(!event(Severity::Critical, Severity::Ok).is_escalation());
        assert!(!event(Severity::Unknown, Severity::Critical).is_escalation());
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(event(Severity::Ok, Severity::Warning)).unwrap();
        assert_eq!(json["node"], "replica-1:5432");
        assert_eq!(json["from"], "ok");
        assert_eq!(json["to"], "warning");
        assert_eq!(json["lag_seconds"], 7.0);
    }

    #[test]
    fn test_event_display() {
        assert_eq!(
            event(Severity::Ok, Severity::Warning).to_string(),
            "replica-1:5432 ok -> warning (lag 7.0s)"
        );
    }
}
