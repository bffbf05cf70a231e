use std::net::IpAddr;

use policy_agent::{Action, Decision};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::dedup::{AlertDeduper, DedupConfig};
use crate::severity::{severity_for_action, Severity};
use crate::sink::AlertSink;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: String,
    pub severity: Severity,
    pub action: Action,
    pub src_addr: IpAddr,
    pub summary: String,
    pub detection_id: String,
    pub decision_id: String,
    pub rule_id: Option<String>,
    pub created_at_unix: i64,
}

impl Alert {
    /// Alert for a fresh decision.
    pub fn for_decision(decision: &Decision, now_unix: i64) -> Self {
        Self {
            alert_id: new_alert_id(),
            severity: severity_for_action(&decision.action),
            action: decision.action,
            src_addr: decision.src_addr,
            summary: format!(
                "{} decided for {} (confidence {:.2})",
                decision.action.as_str(),
                decision.src_addr,
                decision.confidence
            ),
            detection_id: decision.detection_id.clone(),
            decision_id: decision.decision_id.clone(),
            rule_id: None,
            created_at_unix: now_unix,
        }
    }

    /// Escalated alert for a rule outcome (failed apply, permanent
    /// adapter failure, validation reject).
    pub fn for_rule_event(
        decision: &Decision,
        rule_id: Option<&str>,
        event: &str,
        now_unix: i64,
    ) -> Self {
        let mut alert = Self::for_decision(decision, now_unix);
        alert.severity = alert.severity.escalate();
        alert.summary = format!("{}: {}", event, alert.summary);
        alert.rule_id = rule_id.map(|id| id.to_string());
        alert
    }
}

#[derive(Debug, Clone, Default)]
pub struct AlertCounters {
    pub received: u64,
    pub below_threshold: u64,
    pub deduplicated: u64,
    pub delivered: u64,
    pub sink_failures: u64,
}

/// Fan-out point for alerts. Severity filter first, then dedup, then every
/// sink; a failing sink is counted, logged, and otherwise ignored.
pub struct AlertEngine {
    min_severity: Severity,
    deduper: AlertDeduper,
    sinks: Vec<Box<dyn AlertSink>>,
    counters: AlertCounters,
}

impl AlertEngine {
    pub fn new(min_severity: Severity, dedup: DedupConfig, sinks: Vec<Box<dyn AlertSink>>) -> Self {
        Self {
            min_severity,
            deduper: AlertDeduper::new(dedup),
            sinks,
            counters: AlertCounters::default(),
        }
    }

    pub fn counters(&self) -> &AlertCounters {
        &self.counters
    }

    /// Returns true when the alert was delivered to at least one sink.
    pub async fn emit(&mut self, alert: Alert) -> bool {
        self.counters.received = self.counters.received.saturating_add(1);

        if alert.severity < self.min_severity {
            self.counters.below_threshold = self.counters.below_threshold.saturating_add(1);
            return false;
        }
        if !self
            .deduper
            .observe(alert.src_addr, alert.action.family(), alert.created_at_unix)
        {
            self.counters.deduplicated = self.counters.deduplicated.saturating_add(1);
            debug!(alert_id = %alert.alert_id, "duplicate alert suppressed");
            return false;
        }

        let mut delivered = false;
        for sink in &self.sinks {
            match sink.deliver(&alert).await {
                Ok(()) => delivered = true,
                Err(error) => {
                    self.counters.sink_failures = self.counters.sink_failures.saturating_add(1);
                    debug!(sink = sink.sink_id(), error = %error, "alert sink failed");
                }
            }
        }
        if delivered {
            self.counters.delivered = self.counters.delivered.saturating_add(1);
        }
        delivered
    }
}

fn new_alert_id() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("alr_{}", &raw[..12])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::SinkError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct CollectingSink {
        delivered: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl AlertSink for CollectingSink {
        fn sink_id(&self) -> &str {
            "collect"
        }

        async fn deliver(&self, alert: &Alert) -> Result<(), SinkError> {
            if self.fail {
                return Err(SinkError("down".to_string()));
            }
            self.delivered
                .lock()
                .expect("sink lock")
                .push(alert.alert_id.clone());
            Ok(())
        }
    }

    fn decision(action: Action, src: &str) -> Decision {
        Decision {
            decision_id: "dec_1".to_string(),
            detection_id: "det_1".to_string(),
            action,
            confidence: 0.8,
            agent_id: "agent".to_string(),
            fallback_used: false,
            decided_at_unix_ms: 0,
            src_addr: src.parse().expect("addr"),
            dst_port: 80,
            protocol: ingest::Protocol::Tcp,
        }
    }

    #[tokio::test]
    async fn severity_filter_drops_low_alerts() {
        let mut engine = AlertEngine::new(
            Severity::Medium,
            DedupConfig::default(),
            vec![Box::new(CollectingSink {
                delivered: Mutex::new(Vec::new()),
                fail: false,
            })],
        );

        let low = Alert::for_decision(&decision(Action::Monitor, "203.0.113.7"), 100);
        assert!(!engine.emit(low).await);
        assert_eq!(engine.counters().below_threshold, 1);

        let high = Alert::for_decision(&decision(Action::Deny, "203.0.113.7"), 100);
        assert!(engine.emit(high).await);
        assert_eq!(engine.counters().delivered, 1);
    }

    #[tokio::test]
    async fn duplicate_alerts_collapse_within_bucket() {
        let mut engine = AlertEngine::new(
            Severity::Low,
            DedupConfig {
                window_secs: 300,
                capacity: 16,
            },
            vec![Box::new(CollectingSink {
                delivered: Mutex::new(Vec::new()),
                fail: false,
            })],
        );

        let first = Alert::for_decision(&decision(Action::Deny, "203.0.113.7"), 100);
        let second = Alert::for_decision(&decision(Action::Deny, "203.0.113.7"), 150);
        assert!(engine.emit(first).await);
        assert!(!engine.emit(second).await);
        assert_eq!(engine.counters().deduplicated, 1);
    }

    #[tokio::test]
    async fn sink_failure_is_counted_not_propagated() {
        let mut engine = AlertEngine::new(
            Severity::Low,
            DedupConfig::default(),
            vec![Box::new(CollectingSink {
                delivered: Mutex::new(Vec::new()),
                fail: true,
            })],
        );

        let alert = Alert::for_decision(&decision(Action::Deny, "203.0.113.7"), 100);
        assert!(!engine.emit(alert).await);
        assert_eq!(engine.counters().sink_failures, 1);
    }

    #[tokio::test]
    async fn rule_events_escalate_severity() {
        let d = decision(Action::RateLimit(policy_agent::RateTier::Med), "203.0.113.7");
        let alert = Alert::for_rule_event(&d, Some("rule_1"), "apply permanently failed", 100);
        assert_eq!(alert.severity, Severity::High);
        assert_eq!(alert.rule_id.as_deref(), Some("rule_1"));
        assert!(alert.summary.contains("apply permanently failed"));
    }
}
