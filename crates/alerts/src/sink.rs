use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::engine::Alert;

#[derive(Debug)]
pub struct SinkError(pub String);

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sink error: {}", self.0)
    }
}

impl std::error::Error for SinkError {}

/// A downstream alert destination. Delivery failures never propagate
/// upstream; the engine counts them and moves on.
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn sink_id(&self) -> &str;
    async fn deliver(&self, alert: &Alert) -> Result<(), SinkError>;
}

/// Structured-log sink; always available, never fails.
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    fn sink_id(&self) -> &str {
        "log"
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), SinkError> {
        info!(
            alert_id = %alert.alert_id,
            severity = alert.severity.as_str(),
            action = alert.action.as_str(),
            src_addr = %alert.src_addr,
            detection_id = %alert.detection_id,
            "alert: {}",
            alert.summary
        );
        Ok(())
    }
}

/// JSON-over-HTTP sink with a bounded request timeout.
pub struct WebhookSink {
    sink_id: String,
    url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: &str, timeout_ms: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .unwrap_or_default();
        Self {
            sink_id: "webhook".to_string(),
            url: url.to_string(),
            client,
        }
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    fn sink_id(&self) -> &str {
        &self.sink_id
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), SinkError> {
        let response = self
            .client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .map_err(|e| SinkError(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SinkError(format!("status {}", response.status())));
        }
        Ok(())
    }
}
