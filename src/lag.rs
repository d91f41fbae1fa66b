// ABOUTME: Rolling per-node replication lag history
// ABOUTME: Bounded ring buffers with out-of-order rejection and least-squares trend

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::error::MonitorError;
use crate::probe::NodeAddr;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LagSample {
    pub node: NodeAddr,
    pub timestamp_ms: u64,
    pub lag_seconds: f64,
}

/// Direction of lag over a trailing window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LagTrend {
    InsufficientData,
    /// Seconds of lag gained per second of wall time; negative means the
    /// replica is catching up.
    Slope { per_second: f64, samples: usize },
}

impl LagTrend {
    pub fn slope(&self) -> Option<f64> {
        match self {
            LagTrend::Slope { per_second, .. } => Some(*per_second),
            LagTrend::InsufficientData => None,
        }
    }
}

#[derive(Debug)]
pub struct LagTracker {
    capacity: usize,
    /// Samples older than this relative to the newest one are dropped.
    retention: Duration,
    series: HashMap<NodeAddr, VecDeque<LagSample>>,
}

impl LagTracker {
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            retention,
            series: HashMap::new(),
        }
    }

    /// Append a sample. Samples must arrive in non-decreasing timestamp order
    /// per node; an earlier timestamp is rejected and history is left as is.
    pub fn record(
        &mut self,
        node: &NodeAddr,
        timestamp_ms: u64,
        lag_seconds: f64,
    ) -> Result<(), MonitorError> {
        let samples = self.series.entry(node.clone()).or_default();

        if let Some(last) = samples.back() {
            if timestamp_ms < last.timestamp_ms {
                return Err(MonitorError::OutOfOrderSample {
                    node: node.clone(),
                    last_ms: last.timestamp_ms,
                    got_ms: timestamp_ms,
                });
            }
        }

        samples.push_back(LagSample {
            node: node.clone(),
            timestamp_ms,
            lag_seconds,
        });

        while samples.len() > self.capacity {
            samples.pop_front();
        }
        let horizon = timestamp_ms.saturating_sub(self.retention.as_millis() as u64);
        while samples.front().is_some_and(|s| s.timestamp_ms < horizon) {
            samples.pop_front();
        }

        Ok(())
    }

    pub fn current_lag(&self, node: &NodeAddr) -> Option<&LagSample> {
        self.series.get(node).and_then(|s| s.back())
    }

    /// Least-squares slope of lag over samples no older than `window` before
    /// the newest sample.
    pub fn trend(&self, node: &NodeAddr, window: Duration) -> LagTrend {
        let Some(samples) = self.series.get(node) else {
            return LagTrend::InsufficientData;
        };
        let Some(newest) = samples.back() else {
            return LagTrend::InsufficientData;
        };

        let since = newest
            .timestamp_ms
            .saturating_sub(window.as_millis() as u64);
        let points: Vec<(f64, f64)> = samples
            .iter()
            .filter(|s| s.timestamp_ms >= since)
            .map(|s| ((s.timestamp_ms - since) as f64 / 1000.0, s.lag_seconds))
            .collect();

        if points.len() < 2 {
            return LagTrend::InsufficientData;
        }

        let n = points.len() as f64;
        let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
        let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;
        let (num, den) = points.iter().fold((0.0, 0.0), |(num, den), (x, y)| {
            let dx = x - mean_x;
            (num + dx * (y - mean_y), den + dx * dx)
        });

        // All samples share one timestamp.
        if den == 0.0 {
            return LagTrend::InsufficientData;
        }

        LagTrend::Slope {
            per_second: num / den,
            samples: points.len(),
        }
    }

    pub fn samples(&self, node: &NodeAddr) -> impl Iterator<Item = &LagSample> {
        self.series.get(node).into_iter().flat_map(|s| s.iter())
    }

    /// Drop a node's history so the next sample starts a fresh series.
    pub fn reset(&mut self, node: &NodeAddr) {
        if let Some(samples) = self.series.get_mut(node) {
            samples.clear();
        }
    }

    pub fn forget(&mut self, node: &NodeAddr) {
        self.series.remove(node);
    }
}
