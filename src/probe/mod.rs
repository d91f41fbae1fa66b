// ABOUTME: Node probing module
// ABOUTME: Defines the probe capability the scheduler fans out over every known node

pub mod models;
pub mod postgres;

use async_trait::async_trait;
use std::time::Duration;

pub use models::{now_ms, NodeAddr, NodeRole, ProbeResult, DEFAULT_PG_PORT};
pub use postgres::{PostgresProbe, TlsMode};

/// One round trip against a single node.
///
/// Implementations must not fail: connection errors and timeouts are reported
/// as a `ProbeResult` with `reachable == false` and no lag.
#[async_trait]
pub trait NodeProbe: Send + Sync {
    async fn probe(&self, node: &NodeAddr, timeout: Duration) -> ProbeResult;
}
