// ABOUTME: Alerting module
// ABOUTME: Debounced severity state machine plus the sinks its transitions are delivered to

pub mod engine;
pub mod models;
pub mod sink;
pub mod webhook;

pub use engine::{AlertEngine, AlertPolicy, AlertState};
pub use models::{AlertEvent, Severity};
pub use sink::{AlertSink, ChannelSink, LogSink, MultiSink};
pub use webhook::WebhookSink;
