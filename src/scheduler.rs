// ABOUTME: Fixed-interval probing loop with bounded fan-out
// ABOUTME: Owns topology, lag history and alert state; mutates them only after a cycle's probes report in

use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::alert::{AlertEngine, AlertEvent, AlertSink, Severity};
use crate::config::Settings;
use crate::error::MonitorError;
use crate::lag::{LagTracker, LagTrend};
use crate::probe::{now_ms, NodeAddr, NodeProbe, ProbeResult};
use crate::topology::{Node, TopologyGraph};

/// Source of Unix-millisecond timestamps.
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// What happened during one probing cycle.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub probed: usize,
    pub unreachable: usize,
    pub discovered: Vec<NodeAddr>,
    pub anomalies: Vec<MonitorError>,
    pub events: Vec<AlertEvent>,
    pub pruned: Vec<NodeAddr>,
    pub elapsed: Duration,
}

/// Read-only view of one node for rendering.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node: Node,
    pub depth: usize,
    pub lag_seconds: Option<f64>,
    pub trend: LagTrend,
    pub severity: Severity,
}

pub struct Scheduler {
    settings: Settings,
    probe: Arc<dyn NodeProbe>,
    sink: Arc<dyn AlertSink>,
    limiter: Arc<Semaphore>,
    clock: Clock,
    topology: TopologyGraph,
    lag: LagTracker,
    alerts: AlertEngine,
}

impl Scheduler {
    pub fn new(
        settings: Settings,
        probe: Arc<dyn NodeProbe>,
        sink: Arc<dyn AlertSink>,
    ) -> Result<Self, MonitorError> {
        settings.validate()?;

        let clock: Clock = Arc::new(now_ms);
        let mut topology = TopologyGraph::new();
        topology.seed(settings.seeds.iter().cloned(), clock());

        Ok(Self {
            limiter: Arc::new(Semaphore::new(settings.max_concurrent_probes)),
            lag: LagTracker::new(settings.history_capacity, settings.history_retention()),
            alerts: AlertEngine::new(settings.alert_policy()),
            topology,
            clock,
            settings,
            probe,
            sink,
        })
    }

    /// Replace the wall clock, e.g. with a scripted one in tests. Seed nodes
    /// are re-stamped with the new clock.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        let seeds = self.topology.addrs();
        self.topology = TopologyGraph::new();
        self.topology.seed(seeds, clock());
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn topology(&self) -> &TopologyGraph {
        &self.topology
    }

    pub fn lag(&self) -> &LagTracker {
        &self.lag
    }

    pub fn alerts(&self) -> &AlertEngine {
        &self.alerts
    }

    /// Probe every known node once, then apply all results.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, MonitorError> {
        let started = Instant::now();
        let targets = self.topology.addrs();
        let results = self.probe_all(targets).await?;

        let mut report = CycleReport {
            probed: results.len(),
            ..CycleReport::default()
        };

        for result in &results {
            let ingest = self.topology.ingest(result);
            report.discovered.extend(ingest.discovered);
            report.anomalies.extend(ingest.anomalies);

            let Some(lag) = result.lag_seconds else {
                report.unreachable += 1;
                continue;
            };
            if let Err(err) = self.lag.record(&result.node, result.timestamp_ms, lag) {
                warn!("{}; resetting lag history", err);
                self.lag.reset(&result.node);
                self.lag.record(&result.node, result.timestamp_ms, lag)?;
                report.anomalies.push(err);
            }
        }

        // Alerts see the cycle's finished state only.
        for result in &results {
            let observed = result
                .lag_seconds
                .and(self.lag.current_lag(&result.node))
                .map(|sample| sample.lag_seconds);
            if let Some(event) = self
                .alerts
                .observe(&result.node, result.timestamp_ms, observed)
            {
                report.events.push(event);
            }
        }

        for event in &report.events {
            if let Err(e) = self.sink.emit(event).await {
                error!(node = %event.node, "failed to deliver alert: {:#}", e);
            }
        }

        let now = (self.clock)();
        report.pruned = self.topology.prune(now, self.settings.stale_after());
        for addr in &report.pruned {
            self.lag.forget(addr);
            self.alerts.forget(addr);
        }
        // Seeds stay probe targets; nothing else would rediscover a primary.
        self.topology.seed(self.settings.seeds.iter().cloned(), now);

        report.elapsed = started.elapsed();
        Ok(report)
    }

    async fn probe_all(&self, targets: Vec<NodeAddr>) -> Result<Vec<ProbeResult>, MonitorError> {
        let timeout = self.settings.probe_timeout();
        let mut tasks = JoinSet::new();

        for addr in targets {
            let permit = self.limiter.clone().acquire_owned().await.map_err(|_| {
                MonitorError::Scheduler("probe concurrency budget is closed".to_string())
            })?;
            let probe = self.probe.clone();
            let clock = self.clock.clone();

            tasks.spawn(async move {
                let _permit = permit;
                // Guards against probes that ignore their own timeout.
                let outcome =
                    AssertUnwindSafe(tokio::time::timeout(timeout, probe.probe(&addr, timeout)))
                        .catch_unwind()
                        .await;
                match outcome {
                    Ok(Ok(result)) => result,
                    Ok(Err(_)) => {
                        warn!(node = %addr, "probe abandoned after {:?}", timeout);
                        ProbeResult::unreachable(addr, clock())
                    }
                    Err(_) => {
                        error!(node = %addr, "probe panicked; treating node as unreachable");
                        ProbeResult::unreachable(addr, clock())
                    }
                }
            });
        }

        let mut results = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => error!("probe task failed: {}", e),
            }
        }

        // Apply in a fixed order so conflicting edge reports resolve the same
        // way every cycle.
        results.sort_by(|a, b| a.node.cmp(&b.node));
        Ok(results)
    }

    /// Current state of every node in topology order.
    pub fn snapshot(&self) -> Vec<NodeStatus> {
        let window = self.settings.trend_window();
        self.topology
            .nodes()
            .map(|node| NodeStatus {
                depth: self.topology.depth(&node.addr),
                lag_seconds: self.lag.current_lag(&node.addr).map(|s| s.lag_seconds),
                trend: self.lag.trend(&node.addr, window),
                severity: self.alerts.severity(&node.addr),
                node,
            })
            .collect()
    }

    /// Run cycles on a fixed grid (`start + n * interval`) until `shutdown`
    /// flips to true or its sender is dropped. A cycle in progress is always
    /// allowed to finish.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), MonitorError> {
        let period = self.settings.probe_interval();
        let mut ticker = tokio::time::interval_at(Instant::now(), period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            seeds = self.topology.len(),
            interval = ?period,
            max_in_flight = self.settings.max_concurrent_probes,
            "scheduler started"
        );

        let mut cycle: u64 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            cycle += 1;
            let report = self.run_cycle().await?;

            if report.events.is_empty() && report.anomalies.is_empty() {
                debug!(
                    cycle,
                    nodes = self.topology.len(),
                    unreachable = report.unreachable,
                    elapsed = ?report.elapsed,
                    "cycle complete"
                );
            } else {
                info!(
                    cycle,
                    nodes = self.topology.len(),
                    unreachable = report.unreachable,
                    events = report.events.len(),
                    anomalies = report.anomalies.len(),
                    elapsed = ?report.elapsed,
                    "cycle complete"
                );
            }
            if report.elapsed > period {
                warn!(
                    cycle,
                    elapsed = ?report.elapsed,
                    "cycle overran the probe interval; next tick skipped"
                );
            }
        }

        info!(cycles = cycle, "scheduler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::ChannelSink;
    use crate::probe::NodeRole;
    use async_trait::async_trait;
    use std::collections::BTreeSet;

    /// Primary with one replica whose lag is fixed.
    struct StaticProbe {
        replica_lag: f64,
    }

    #[async_trait]
    impl NodeProbe for StaticProbe {
        async fn probe(&self, node: &NodeAddr, _timeout: Duration) -> ProbeResult {
            if node.host == "primary" {
                ProbeResult::reachable(
                    node.clone(),
                    now_ms(),
                    0.0,
                    NodeRole::Primary,
                    BTreeSet::from([NodeAddr::new("replica", 5432)]),
                )
            } else {
                ProbeResult::reachable(
                    node.clone(),
                    now_ms(),
                    self.replica_lag,
                    NodeRole::Replica,
                    BTreeSet::new(),
                )
            }
        }
    }

    fn settings() -> Settings {
        Settings {
            seeds: vec![NodeAddr::new("primary", 5432)],
            escalate_after: 1,
            ..Settings::default()
        }
    }

    #[test]
    fn test_rejects_invalid_settings() {
        let (sink, _rx) = ChannelSink::new();
        let settings = Settings {
            critical_lag_secs: 1.0,
            warning_lag_secs: 2.0,
            ..settings()
        };
        let result = Scheduler::new(
            settings,
            Arc::new(StaticProbe { replica_lag: 0.0 }),
            Arc::new(sink),
        );
        assert!(matches!(result, Err(MonitorError::ConfigurationInvalid(_))));
    }

    #[tokio::test]
    async fn test_replica_discovered_then_probed() {
        let (sink, mut rx) = ChannelSink::new();
        let mut scheduler = Scheduler::new(
            settings(),
            Arc::new(StaticProbe { replica_lag: 45.0 }),
            Arc::new(sink),
        )
        .unwrap();

        let first = scheduler.run_cycle().await.unwrap();
        assert_eq!(first.probed, 1);
        assert_eq!(first.discovered, vec![NodeAddr::new("replica", 5432)]);

        let second = scheduler.run_cycle().await.unwrap();
        assert_eq!(second.probed, 2);
        assert_eq!(second.events.len(), 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.to, Severity::Critical);

        let snapshot = scheduler.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].node.role, Some(NodeRole::Primary));
        assert_eq!(snapshot[1].depth, 1);
        assert_eq!(snapshot[1].lag_seconds, Some(45.0));
        assert_eq!(snapshot[1].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (sink, _rx) = ChannelSink::new();
        let scheduler = Scheduler::new(
            settings(),
            Arc::new(StaticProbe { replica_lag: 0.0 }),
            Arc::new(sink),
        )
        .unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(rx));
        tx.send(true).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
        assert!(outcome.is_ok());
    }
}
