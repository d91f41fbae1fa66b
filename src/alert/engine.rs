// ABOUTME: Debounced per-node alert state machine
// ABOUTME: Escalates and recovers only after consecutive samples agree, and tracks unreachable nodes separately

use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

use super::models::{AlertEvent, Severity};
use crate::probe::NodeAddr;

/// Thresholds and debounce counts for lag alerts.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertPolicy {
    pub warning_secs: f64,
    pub critical_secs: f64,
    /// Consecutive samples above the current level required to escalate.
    pub escalate_after: u32,
    /// Consecutive samples below the current level required to recover.
    pub recover_after: u32,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            warning_secs: 5.0,
            critical_secs: 30.0,
            escalate_after: 3,
            recover_after: 3,
        }
    }
}

impl AlertPolicy {
    /// Level a single lag sample points to; thresholds are inclusive.
    pub fn classify(&self, lag_seconds: f64) -> Severity {
        if lag_seconds >= self.critical_secs {
            Severity::Critical
        } else if lag_seconds >= self.warning_secs {
            Severity::Warning
        } else {
            Severity::Ok
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertState {
    pub severity: Severity,
    /// Last lag-based severity. Kept while the node is `Unknown` so that a
    /// node coming back is debounced against where it was.
    pub baseline: Severity,
    pub breach_streak: u32,
    pub healthy_streak: u32,
    pub last_transition_ms: Option<u64>,
    /// Level the running streak would move to: the mildest level seen while
    /// breaching, the worst level seen while recovering.
    #[serde(skip)]
    streak_target: Option<Severity>,
}

impl Default for AlertState {
    fn default() -> Self {
        Self {
            severity: Severity::Ok,
            baseline: Severity::Ok,
            breach_streak: 0,
            healthy_streak: 0,
            last_transition_ms: None,
            streak_target: None,
        }
    }
}

impl AlertState {
    fn clear_streaks(&mut self) {
        self.breach_streak = 0;
        self.healthy_streak = 0;
        self.streak_target = None;
    }

    /// Count `level` against `current`; returns the level to move to once a
    /// streak is long enough.
    fn advance(&mut self, policy: &AlertPolicy, current: Severity, level: Severity) -> Option<Severity> {
        let current = rank(current);
        let observed = rank(level);

        if observed > current {
            self.healthy_streak = 0;
            self.breach_streak += 1;
            self.streak_target = match self.streak_target {
                Some(target) if self.breach_streak > 1 && rank(target) < observed => Some(target),
                _ => Some(level),
            };
            if self.breach_streak >= policy.escalate_after {
                return self.streak_target;
            }
        } else if observed < current {
            self.breach_streak = 0;
            self.healthy_streak += 1;
            self.streak_target = match self.streak_target {
                Some(target) if self.healthy_streak > 1 && rank(target) > observed => Some(target),
                _ => Some(level),
            };
            if self.healthy_streak >= policy.recover_after {
                return self.streak_target;
            }
        } else {
            self.clear_streaks();
        }
        None
    }

    fn transition(
        &mut self,
        node: &NodeAddr,
        to: Severity,
        timestamp_ms: u64,
        lag_seconds: Option<f64>,
    ) -> AlertEvent {
        let from = self.severity;
        self.severity = to;
        if to != Severity::Unknown {
            self.baseline = to;
        }
        self.last_transition_ms = Some(timestamp_ms);
        debug!(node = %node, %from, %to, "alert state changed");
        AlertEvent {
            node: node.clone(),
            from,
            to,
            timestamp_ms,
            lag_seconds,
        }
    }
}

fn rank(severity: Severity) -> u8 {
    severity.rank().unwrap_or(0)
}

#[derive(Debug)]
pub struct AlertEngine {
    policy: AlertPolicy,
    states: HashMap<NodeAddr, AlertState>,
}

impl AlertEngine {
    pub fn new(policy: AlertPolicy) -> Self {
        Self {
            policy,
            states: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &AlertPolicy {
        &self.policy
    }

    /// Feed one observation. `lag_seconds == None` means the node could not
    /// be reached. Returns an event only when the severity changes.
    pub fn observe(
        &mut self,
        node: &NodeAddr,
        timestamp_ms: u64,
        lag_seconds: Option<f64>,
    ) -> Option<AlertEvent> {
        let state = self.states.entry(node.clone()).or_default();

        let Some(lag) = lag_seconds else {
            state.clear_streaks();
            if state.severity == Severity::Unknown {
                return None;
            }
            return Some(state.transition(node, Severity::Unknown, timestamp_ms, None));
        };

        let level = self.policy.classify(lag);
        let resuming = state.severity == Severity::Unknown;
        let current = if resuming {
            state.baseline
        } else {
            state.severity
        };

        match state.advance(&self.policy, current, level) {
            Some(to) => {
                state.clear_streaks();
                Some(state.transition(node, to, timestamp_ms, Some(lag)))
            }
            // Back from unreachable: return to the baseline, keeping the
            // streak this sample started.
            None if resuming => Some(state.transition(node, current, timestamp_ms, Some(lag))),
            None => None,
        }
    }

    pub fn state(&self, node: &NodeAddr) -> Option<&AlertState> {
        self.states.get(node)
    }

    /// Current severity; nodes never observed are `Ok`.
    pub fn severity(&self, node: &NodeAddr) -> Severity {
        self.states
            .get(node)
            .map(|s| s.severity)
            .unwrap_or(Severity::Ok)
    }

    pub fn forget(&mut self, node: &NodeAddr) {
        self.states.remove(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> NodeAddr {
        NodeAddr::new("replica-1", 5432)
    }

    fn engine(escalate_after: u32, recover_after: u32) -> AlertEngine {
        AlertEngine::new(AlertPolicy {
            warning_secs: 5.0,
            critical_secs: 15.0,
            escalate_after,
            recover_after,
        })
    }

    /// Feed lags one per second; return (sample index, from, to) per event.
    fn run(engine: &mut AlertEngine, lags: &[Option<f64>]) -> Vec<(usize, Severity, Severity)> {
        lags.iter()
            .enumerate()
            .filter_map(|(i, lag)| {
                engine
                    .observe(&node(), i as u64 * 1_000, *lag)
                    .map(|e| (i + 1, e.from, e.to))
            })
            .collect()
    }

    #[test]
    fn test_escalates_through_warning_to_critical() {
        let mut engine = engine(2, 2);
        let lags = [3.0, 3.0, 7.0, 8.0, 16.0, 17.0].map(Some);
        assert_eq!(
            run(&mut engine, &lags),
            vec![
                (4, Severity::Ok, Severity::Warning),
                (6, Severity::Warning, Severity::Critical),
            ]
        );
    }

    #[test]
    fn test_transient_spike_emits_nothing() {
        let mut engine = engine(3, 3);
        let lags = [1.0, 20.0, 20.0, 1.0, 20.0, 1.0].map(Some);
        assert!(run(&mut engine, &lags).is_empty());
        assert_eq!(engine.severity(&node()), Severity::Ok);
    }

    #[test]
    fn test_escalation_needs_exact_count() {
        let mut engine = engine(3, 1);
        let events = run(&mut engine, &[Some(6.0), Some(6.0)]);
        assert!(events.is_empty());
        let event = engine.observe(&node(), 10_000, Some(6.0)).unwrap();
        assert_eq!(event.to, Severity::Warning);
        assert_eq!(event.lag_seconds, Some(6.0));
        assert_eq!(event.timestamp_ms, 10_000);
    }

    #[test]
    fn test_mixed_breach_escalates_to_mildest_level() {
        let mut engine = engine(2, 2);
        let events = run(&mut engine, &[Some(20.0), Some(7.0)]);
        assert_eq!(events, vec![(2, Severity::Ok, Severity::Warning)]);
    }

    #[test]
    fn test_recovery_needs_consecutive_healthy_samples() {
        let mut engine = engine(1, 3);
        let lags = [20.0, 1.0, 1.0, 20.0, 1.0, 1.0, 1.0].map(Some);
        assert_eq!(
            run(&mut engine, &lags),
            vec![
                (1, Severity::Ok, Severity::Critical),
                (7, Severity::Critical, Severity::Ok),
            ]
        );
    }

    #[test]
    fn test_recovery_lands_on_worst_level_seen() {
        let mut engine = engine(1, 2);
        let lags = [20.0, 1.0, 7.0].map(Some);
        assert_eq!(
            run(&mut engine, &lags),
            vec![
                (1, Severity::Ok, Severity::Critical),
                (3, Severity::Critical, Severity::Warning),
            ]
        );
    }

    #[test]
    fn test_unreachable_goes_unknown_not_critical() {
        let mut engine = engine(2, 2);
        let lags = [Some(2.0), Some(2.0), Some(2.0), None];
        assert_eq!(
            run(&mut engine, &lags),
            vec![(4, Severity::Ok, Severity::Unknown)]
        );
        // Repeated failures stay silent.
        assert!(engine.observe(&node(), 10_000, None).is_none());
    }

    #[test]
    fn test_unreachable_does_not_count_toward_streak() {
        let mut engine = engine(2, 2);
        let lags = [Some(7.0), None, Some(7.0)];
        assert_eq!(
            run(&mut engine, &lags),
            vec![
                (2, Severity::Ok, Severity::Unknown),
                (3, Severity::Unknown, Severity::Ok),
            ]
        );
        assert_eq!(engine.state(&node()).unwrap().breach_streak, 1);

        // A second breach after returning completes the streak.
        let event = engine.observe(&node(), 10_000, Some(8.0)).unwrap();
        assert_eq!((event.from, event.to), (Severity::Ok, Severity::Warning));
    }

    #[test]
    fn test_spikes_between_outages_do_not_page() {
        let mut engine = engine(3, 3);
        let lags = [Some(2.0), None, Some(20.0), None, Some(20.0), Some(2.0)];
        assert_eq!(
            run(&mut engine, &lags),
            vec![
                (2, Severity::Ok, Severity::Unknown),
                (3, Severity::Unknown, Severity::Ok),
                (4, Severity::Ok, Severity::Unknown),
                (5, Severity::Unknown, Severity::Ok),
            ]
        );
    }

    #[test]
    fn test_return_from_unknown_keeps_baseline() {
        let mut engine = engine(1, 2);
        let lags = [Some(20.0), None, Some(1.0), Some(1.0)];
        assert_eq!(
            run(&mut engine, &lags),
            vec![
                (1, Severity::Ok, Severity::Critical),
                (2, Severity::Critical, Severity::Unknown),
                (3, Severity::Unknown, Severity::Critical),
                (4, Severity::Critical, Severity::Ok),
            ]
        );
        assert_eq!(engine.state(&node()).unwrap().baseline, Severity::Ok);
    }

    #[test]
    fn test_immediate_escalation_reported_from_unknown() {
        let mut engine = engine(1, 1);
        let events = run(&mut engine, &[None, Some(20.0)]);
        assert_eq!(
            events,
            vec![
                (1, Severity::Ok, Severity::Unknown),
                (2, Severity::Unknown, Severity::Critical),
            ]
        );
    }

    #[test]
    fn test_transition_records_timestamp() {
        let mut engine = engine(1, 1);
        engine.observe(&node(), 42_000, Some(9.0));
        let state = engine.state(&node()).unwrap();
        assert_eq!(state.severity, Severity::Warning);
        assert_eq!(state.last_transition_ms, Some(42_000));
    }
}
