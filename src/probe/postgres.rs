// ABOUTME: PostgreSQL implementation of the node probe
// ABOUTME: Reads recovery state, replay lag and attached replicas over one short-lived connection

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, warn};

use super::models::{now_ms, NodeAddr, NodeRole, ProbeResult};
use super::NodeProbe;
use crate::error::MonitorError;

const RECOVERY_QUERY: &str = "SELECT pg_is_in_recovery()";

// Zero when everything received has been replayed, otherwise the age of the
// last replayed transaction.
const REPLICA_LAG_QUERY: &str = "SELECT COALESCE(
    CASE
        WHEN pg_last_wal_receive_lsn() = pg_last_wal_replay_lsn() THEN 0
        ELSE GREATEST(0, EXTRACT(EPOCH FROM now() - pg_last_xact_replay_timestamp()))
    END, 0)::float8";

const REPLICA_HOSTS_QUERY: &str = "SELECT host(client_addr)
    FROM pg_stat_replication
    WHERE client_addr IS NOT NULL
    ORDER BY 1";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    #[default]
    Disable,
    Require,
}

pub struct PostgresProbe {
    /// libpq-style connection string without host/port, e.g.
    /// `user=monitor dbname=postgres`.
    conn_template: String,
    tls: TlsMode,
    /// Port assumed for replicas discovered through `pg_stat_replication`,
    /// which only exposes the client address.
    replica_port: u16,
}

impl PostgresProbe {
    pub fn new(conn_template: String, tls: TlsMode, replica_port: u16) -> Result<Self> {
        // Fail at construction rather than on every probe.
        let config = conn_template
            .parse::<tokio_postgres::Config>()
            .context("Failed to parse connection string template")?;

        // Each probe appends the node's host and port; any already in the
        // template would be tried first.
        if !config.get_hosts().is_empty()
            || !config.get_hostaddrs().is_empty()
            || !config.get_ports().is_empty()
        {
            return Err(MonitorError::ConfigurationInvalid(
                "connection template must not set host, hostaddr or port".to_string(),
            )
            .into());
        }

        Ok(Self {
            conn_template,
            tls,
            replica_port,
        })
    }

    fn config_for(&self, node: &NodeAddr, timeout: Duration) -> Result<tokio_postgres::Config> {
        let mut config: tokio_postgres::Config = self
            .conn_template
            .parse()
            .context("Failed to parse connection string template")?;
        config
            .host(&node.host)
            .port(node.port)
            .connect_timeout(timeout)
            .application_name("pg-topology-monitor");
        Ok(config)
    }

    async fn connect(&self, node: &NodeAddr, timeout: Duration) -> Result<Client> {
        let config = self.config_for(node, timeout)?;
        let label = node.to_string();

        match self.tls {
            TlsMode::Disable => {
                let (client, connection) = config
                    .connect(NoTls)
                    .await
                    .with_context(|| format!("Failed to connect to {}", label))?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        debug!(node = %label, "connection closed with error: {}", e);
                    }
                });
                Ok(client)
            }
            TlsMode::Require => {
                let connector = native_tls::TlsConnector::builder()
                    .build()
                    .context("Failed to build TLS connector")?;
                let connector = postgres_native_tls::MakeTlsConnector::new(connector);
                let (client, connection) = config
                    .connect(connector)
                    .await
                    .with_context(|| format!("Failed to connect to {} over TLS", label))?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        debug!(node = %label, "connection closed with error: {}", e);
                    }
                });
                Ok(client)
            }
        }
    }

    async fn query_status(&self, node: &NodeAddr, timeout: Duration) -> Result<ProbeResult> {
        let client = self.connect(node, timeout).await?;

        let in_recovery: bool = client
            .query_one(RECOVERY_QUERY, &[])
            .await
            .context("Failed to read recovery state")?
            .get(0);

        let (role, lag_seconds) = if in_recovery {
            let lag: f64 = client
                .query_one(REPLICA_LAG_QUERY, &[])
                .await
                .context("Failed to read replay lag")?
                .get(0);
            (NodeRole::Replica, lag)
        } else {
            (NodeRole::Primary, 0.0)
        };

        // Cascading replicas also populate pg_stat_replication, so this is
        // asked of every node, not only the primary.
        let children = client
            .query(REPLICA_HOSTS_QUERY, &[])
            .await
            .context("Failed to list attached replicas")?
            .iter()
            .filter_map(|row| row.get::<_, Option<String>>(0))
            .map(|host| NodeAddr::new(host, self.replica_port))
            .collect::<BTreeSet<_>>();

        Ok(ProbeResult::reachable(
            node.clone(),
            now_ms(),
            lag_seconds,
            role,
            children,
        ))
    }
}

#[async_trait]
impl NodeProbe for PostgresProbe {
    async fn probe(&self, node: &NodeAddr, timeout: Duration) -> ProbeResult {
        let outcome = tokio::time::timeout(timeout, self.query_status(node, timeout)).await;

        let err = match outcome {
            Ok(Ok(result)) => {
                debug!(
                    node = %node,
                    lag_seconds = ?result.lag_seconds,
                    replicas = result.children.len(),
                    "probe complete"
                );
                return result;
            }
            Ok(Err(e)) => MonitorError::ProbeUnreachable {
                node: node.clone(),
                reason: format!("{:#}", e),
            },
            Err(_) => MonitorError::ProbeUnreachable {
                node: node.clone(),
                reason: format!("timed out after {:?}", timeout),
            },
        };

        warn!("{}", err);
        ProbeResult::unreachable(node.clone(), now_ms())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_creation() {
        let probe = PostgresProbe::new(
            "user=monitor dbname=postgres".to_string(),
            TlsMode::Disable,
            5432,
        );
        assert!(probe.is_ok());
    }

    #[test]
    fn test_probe_rejects_malformed_template() {
        let probe = PostgresProbe::new("user='unterminated".to_string(), TlsMode::Disable, 5432);
        assert!(probe.is_err());
    }

    #[test]
    fn test_probe_rejects_template_with_host_or_port() {
        for template in [
            "user=monitor host=db-primary",
            "user=monitor hostaddr=10.0.0.1",
            "user=monitor port=5433",
        ] {
            let err = PostgresProbe::new(template.to_string(), TlsMode::Disable, 5432)
                .err()
                .unwrap_or_else(|| panic!("accepted {}", template));
            assert!(
                matches!(
                    err.downcast_ref::<MonitorError>(),
                    Some(MonitorError::ConfigurationInvalid(_))
                ),
                "unexpected error for {}: {:#}",
                template,
                err
            );
        }
    }

    #[test]
    fn test_config_targets_node() {
        let probe =
            PostgresProbe::new("user=monitor".to_string(), TlsMode::Disable, 5432).unwrap();
        let config = probe
            .config_for(&NodeAddr::new("replica-3", 5433), Duration::from_secs(2))
            .unwrap();
        assert_eq!(config.get_ports(), &[5433]);
        assert_eq!(
            config.get_hosts(),
            &[tokio_postgres::config::Host::Tcp("replica-3".to_string())]
        );
        assert_eq!(config.get_user(), Some("monitor"));
    }

    #[tokio::test]
    async fn test_unreachable_node_reports_failure() {
        let probe =
            PostgresProbe::new("user=monitor".to_string(), TlsMode::Disable, 5432).unwrap();
        // Port 1 on localhost refuses connections.
        let result = probe
            .probe(&NodeAddr::new("127.0.0.1", 1), Duration::from_millis(500))
            .await;
        assert!(!result.reachable);
        assert!(result.lag_seconds.is_none());
    }
}
