// ABOUTME: Alert sink abstraction and in-process implementations
// ABOUTME: Log, channel and fan-out sinks; transports stay outside the alert engine

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::models::{AlertEvent, Severity};

/// Destination for alert transitions.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn emit(&self, event: &AlertEvent) -> Result<()>;
}

/// Writes transitions to the tracing log.
#[derive(Debug, Default, Clone)]
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    async fn emit(&self, event: &AlertEvent) -> Result<()> {
        match event.to {
            Severity::Ok => info!(
                node = %event.node,
                from = %event.from,
                lag_seconds = ?event.lag_seconds,
                "replication lag recovered"
            ),
            Severity::Unknown => warn!(
                node = %event.node,
                from = %event.from,
                "node unreachable; replication state unknown"
            ),
            Severity::Warning | Severity::Critical if event.is_escalation() => warn!(
                node = %event.node,
                from = %event.from,
                to = %event.to,
                lag_seconds = ?event.lag_seconds,
                "replication lag alert"
            ),
            Severity::Warning | Severity::Critical => info!(
                node = %event.node,
                from = %event.from,
                to = %event.to,
                lag_seconds = ?event.lag_seconds,
                "replication lag alert level changed"
            ),
        }
        Ok(())
    }
}

/// Forwards events to an in-process consumer such as a dashboard task.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<AlertEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AlertEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl AlertSink for ChannelSink {
    async fn emit(&self, event: &AlertEvent) -> Result<()> {
        self.tx
            .send(event.clone())
            .context("Alert receiver was dropped")?;
        Ok(())
    }
}

/// Delivers every event to all wrapped sinks concurrently. One sink failing
/// does not stop delivery to the others.
#[derive(Clone, Default)]
pub struct MultiSink {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl MultiSink {
    pub fn new(sinks: Vec<Arc<dyn AlertSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn AlertSink>) {
        self.sinks.push(sink);
    }
}

#[async_trait]
impl AlertSink for MultiSink {
    async fn emit(&self, event: &AlertEvent) -> Result<()> {
        let results = join_all(self.sinks.iter().map(|sink| sink.emit(event))).await;

        let failures = results.into_iter().filter_map(Result::err).collect::<Vec<_>>();
        for err in &failures {
            error!(node = %event.node, "alert delivery failed: {:#}", err);
        }
        if !failures.is_empty() {
            anyhow::bail!(
                "{} of {} alert sinks failed for {}",
                failures.len(),
                self.sinks.len(),
                event.node
            );
        }
        Ok(())
    }
}
