// ABOUTME: Monitor settings with defaults, TOML loading and fail-fast validation
// ABOUTME: Passed explicitly to the scheduler; there is no global configuration state

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::alert::AlertPolicy;
use crate::error::MonitorError;
use crate::probe::{NodeAddr, TlsMode, DEFAULT_PG_PORT};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Nodes probed on the first cycle; replicas are discovered from them.
    pub seeds: Vec<NodeAddr>,
    pub probe_interval_secs: f64,
    pub probe_timeout_secs: f64,
    pub max_concurrent_probes: usize,
    pub warning_lag_secs: f64,
    pub critical_lag_secs: f64,
    pub escalate_after: u32,
    pub recover_after: u32,
    /// Nodes without a successful probe for this long are evicted.
    pub stale_after_secs: f64,
    pub history_retention_secs: f64,
    pub history_capacity: usize,
    /// Window the reported lag trend is computed over.
    pub trend_window_secs: f64,
    pub connection: ConnectionSettings,
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionSettings {
    /// Connection string without host and port, e.g. `user=monitor dbname=postgres`.
    pub template: String,
    pub tls: TlsMode,
    /// Port assumed for replicas discovered from `pg_stat_replication`.
    pub replica_port: u16,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            template: "user=postgres dbname=postgres".to_string(),
            tls: TlsMode::Disable,
            replica_port: DEFAULT_PG_PORT,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            probe_interval_secs: 10.0,
            probe_timeout_secs: 3.0,
            max_concurrent_probes: 16,
            warning_lag_secs: 5.0,
            critical_lag_secs: 30.0,
            escalate_after: 3,
            recover_after: 3,
            stale_after_secs: 300.0,
            history_retention_secs: 3600.0,
            history_capacity: 720,
            trend_window_secs: 300.0,
            connection: ConnectionSettings::default(),
            webhook_url: None,
        }
    }
}

fn positive(name: &str, value: f64) -> Result<(), MonitorError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(MonitorError::ConfigurationInvalid(format!(
            "{} must be a positive number of seconds, got {}",
            name, value
        )))
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let settings: Settings = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), MonitorError> {
        positive("probe_interval_secs", self.probe_interval_secs)?;
        positive("probe_timeout_secs", self.probe_timeout_secs)?;
        positive("stale_after_secs", self.stale_after_secs)?;
        positive("history_retention_secs", self.history_retention_secs)?;
        positive("trend_window_secs", self.trend_window_secs)?;

        if !self.warning_lag_secs.is_finite() || self.warning_lag_secs < 0.0 {
            return Err(MonitorError::ConfigurationInvalid(format!(
                "warning_lag_secs must be non-negative, got {}",
                self.warning_lag_secs
            )));
        }
        if !self.critical_lag_secs.is_finite() || self.critical_lag_secs <= self.warning_lag_secs
        {
            return Err(MonitorError::ConfigurationInvalid(format!(
                "critical_lag_secs ({}) must be greater than warning_lag_secs ({})",
                self.critical_lag_secs, self.warning_lag_secs
            )));
        }
        if self.max_concurrent_probes == 0 {
            return Err(MonitorError::ConfigurationInvalid(
                "max_concurrent_probes must be at least 1".to_string(),
            ));
        }
        if self.escalate_after == 0 || self.recover_after == 0 {
            return Err(MonitorError::ConfigurationInvalid(
                "escalate_after and recover_after must be at least 1".to_string(),
            ));
        }
        if self.history_capacity == 0 {
            return Err(MonitorError::ConfigurationInvalid(
                "history_capacity must be at least 1".to_string(),
            ));
        }

        if self.probe_timeout_secs >= self.probe_interval_secs {
            warn!(
                "probe_timeout_secs ({}) is not shorter than probe_interval_secs ({}); slow cycles will skip ticks",
                self.probe_timeout_secs, self.probe_interval_secs
            );
        }
        if self.stale_after_secs < self.probe_interval_secs {
            warn!(
                "stale_after_secs ({}) is shorter than one probe interval ({}); nodes may be evicted between probes",
                self.stale_after_secs, self.probe_interval_secs
            );
        }

        Ok(())
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs_f64(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.probe_timeout_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs_f64(self.stale_after_secs)
    }

    pub fn history_retention(&self) -> Duration {
        Duration::from_secs_f64(self.history_retention_secs)
    }

    pub fn trend_window(&self) -> Duration {
        Duration::from_secs_f64(self.trend_window_secs)
    }

    pub fn alert_policy(&self) -> AlertPolicy {
        AlertPolicy {
            warning_secs: self.warning_lag_secs,
            critical_secs: self.critical_lag_secs,
            escalate_after: self.escalate_after,
            recover_after: self.recover_after,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn test_critical_must_exceed_warning() {
        let settings = Settings {
            warning_lag_secs: 10.0,
            critical_lag_secs: 10.0,
            ..Settings::default()
        };
        let err = settings.validate().unwrap_err();
        assert!(matches!(err, MonitorError::ConfigurationInvalid(_)));
        assert!(err.to_string().contains("critical_lag_secs"));
    }

    #[test]
    fn test_rejects_zero_budgets() {
        for settings in [
            Settings {
                max_concurrent_probes: 0,
                ..Settings::default()
            },
            Settings {
                escalate_after: 0,
                ..Settings::default()
            },
            Settings {
                probe_interval_secs: 0.0,
                ..Settings::default()
            },
            Settings {
                history_capacity: 0,
                ..Settings::default()
            },
        ] {
            assert!(settings.validate().is_err(), "{:?}", settings);
        }
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
seeds = ["db-primary:5432", "db-replica-1"]
probe_interval_secs = 5
warning_lag_secs = 2.5
critical_lag_secs = 15
escalate_after = 2

[connection]
template = "user=monitor dbname=postgres"
tls = "require"
"#
        )
        .unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(
            settings.seeds,
            vec![
                NodeAddr::new("db-primary", 5432),
                NodeAddr::new("db-replica-1", 5432)
            ]
        );
        assert_eq!(settings.probe_interval(), Duration::from_secs(5));
        assert_eq!(settings.escalate_after, 2);
        assert_eq!(settings.recover_after, 3);
        assert_eq!(settings.connection.tls, TlsMode::Require);
        assert!(settings.validate().is_ok());
        assert_eq!(settings.alert_policy().critical_secs, 15.0);
    }

    #[test]
    fn test_load_rejects_unknown_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "lag_threshold = 5").unwrap();
        assert!(Settings::load(file.path()).is_err());
    }
}
