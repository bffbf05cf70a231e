//! Alerting: severity-filtered, de-duplicated notification stream to
//! downstream sinks. Sink failures are counted and never back-pressure
//! the detection pipeline.

mod dedup;
mod engine;
mod severity;
mod sink;

pub use dedup::{AlertDeduper, DedupConfig};
pub use engine::{Alert, AlertCounters, AlertEngine};
pub use severity::{severity_for_action, Severity};
pub use sink::{AlertSink, LogSink, SinkError, WebhookSink};
