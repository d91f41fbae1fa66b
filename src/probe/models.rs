// ABOUTME: Data structures describing probed nodes and their replication status
// ABOUTME: Node addresses serialize as "host:port" strings for config and alert payloads

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

pub const DEFAULT_PG_PORT: u16 = 5432;

/// Identity of a database node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeAddr {
    pub host: String,
    pub port: u16,
}

impl NodeAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for NodeAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("node address is empty".to_string());
        }

        // Bracketed IPv6: [::1]:5432 or [::1]
        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| format!("unterminated '[' in node address '{}'", s))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => parse_port(p, s)?,
                None if tail.is_empty() => DEFAULT_PG_PORT,
                None => return Err(format!("unexpected text after ']' in '{}'", s)),
            };
            return Ok(NodeAddr::new(host, port));
        }

        match s.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => {
                if host.is_empty() {
                    return Err(format!("missing host in node address '{}'", s));
                }
                Ok(NodeAddr::new(host, parse_port(port, s)?))
            }
            // Bare IPv6 literal without a port
            Some(_) => Ok(NodeAddr::new(s, DEFAULT_PG_PORT)),
            None => Ok(NodeAddr::new(s, DEFAULT_PG_PORT)),
        }
    }
}

fn parse_port(port: &str, whole: &str) -> Result<u16, String> {
    port.parse::<u16>()
        .map_err(|_| format!("invalid port '{}' in node address '{}'", port, whole))
}

impl TryFrom<String> for NodeAddr {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeAddr> for String {
    fn from(addr: NodeAddr) -> Self {
        addr.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Primary,
    Replica,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NodeRole::Primary => write!(f, "primary"),
            NodeRole::Replica => write!(f, "replica"),
        }
    }
}

/// Point-in-time snapshot of one node, produced by a probe.
///
/// `lag_seconds` is `None` exactly when the probe failed; `reachable` mirrors it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub node: NodeAddr,
    pub timestamp_ms: u64,
    pub lag_seconds: Option<f64>,
    pub reachable: bool,
    /// Role reported by the server itself, when it answered.
    pub role: Option<NodeRole>,
    pub children: BTreeSet<NodeAddr>,
}

impl ProbeResult {
    pub fn reachable(
        node: NodeAddr,
        timestamp_ms: u64,
        lag_seconds: f64,
        role: NodeRole,
        children: BTreeSet<NodeAddr>,
    ) -> Self {
        Self {
            node,
            timestamp_ms,
            lag_seconds: Some(lag_seconds),
            reachable: true,
            role: Some(role),
            children,
        }
    }

    pub fn unreachable(node: NodeAddr, timestamp_ms: u64) -> Self {
        Self {
            node,
            timestamp_ms,
            lag_seconds: None,
            reachable: false,
            role: None,
            children: BTreeSet::new(),
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
