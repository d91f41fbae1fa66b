// ABOUTME: Library root for the PostgreSQL replication topology monitor
// ABOUTME: Exposes probing, topology, lag history, alerting and the scheduler that drives them

pub mod alert;
pub mod config;
pub mod error;
pub mod lag;
pub mod probe;
pub mod render;
pub mod scheduler;
pub mod topology;

pub use alert::{AlertEngine, AlertEvent, AlertPolicy, AlertSink, Severity};
pub use config::Settings;
pub use error::MonitorError;
pub use lag::{LagSample, LagTracker, LagTrend};
pub use probe::{NodeAddr, NodeProbe, NodeRole, ProbeResult};
pub use scheduler::{CycleReport, NodeStatus, Scheduler};
pub use topology::{Node, TopologyGraph};
