use adapters::UniversalRule;
use detection::Detection;
use orchestrator::AdapterAttempt;
use policy_agent::Decision;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wall-clock stamps at each pipeline stage, for post-hoc latency and
/// ordering questions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageTimestamps {
    pub detected_unix_ms: i64,
    pub decided_unix_ms: i64,
    pub synthesized_unix_ms: Option<i64>,
    pub applied_unix_ms: Option<i64>,
}

/// The immutable per-decision audit record: everything needed to explain
/// a decision after the fact lives here, referenced by id only, with no
/// object graph back into the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub audit_id: String,
    pub detection_id: String,
    pub decision_id: String,
    pub rule_id: Option<String>,
    pub created_at_unix: i64,

    /// Full detection: feature vector, per-detector verdicts with
    /// contributions, aggregate score and label.
    pub detection: Detection,
    pub decision: Decision,
    pub rule: Option<UniversalRule>,
    /// Populated when validation refused the synthesized rule.
    pub validation_rejected: Option<String>,
    pub adapter_attempts: Vec<AdapterAttempt>,
    pub rule_lifecycle: Option<String>,
    pub timestamps: StageTimestamps,
}

impl AuditRecord {
    pub fn new(
        detection: Detection,
        decision: Decision,
        created_at_unix: i64,
    ) -> Self {
        Self {
            audit_id: new_audit_id(),
            detection_id: detection.detection_id.clone(),
            decision_id: decision.decision_id.clone(),
            rule_id: None,
            created_at_unix,
            timestamps: StageTimestamps {
                detected_unix_ms: detection.decided_at_unix_ms,
                decided_unix_ms: decision.decided_at_unix_ms,
                synthesized_unix_ms: None,
                applied_unix_ms: None,
            },
            detection,
            decision,
            rule: None,
            validation_rejected: None,
            adapter_attempts: Vec::new(),
            rule_lifecycle: None,
        }
    }

    pub fn with_rule(mut self, rule: UniversalRule, synthesized_unix_ms: i64) -> Self {
        self.rule_id = Some(rule.rule_id.clone());
        self.rule = Some(rule);
        self.timestamps.synthesized_unix_ms = Some(synthesized_unix_ms);
        self
    }

    pub fn with_adapter_attempts(
        mut self,
        attempts: Vec<AdapterAttempt>,
        lifecycle: &str,
        applied_unix_ms: i64,
    ) -> Self {
        self.adapter_attempts = attempts;
        self.rule_lifecycle = Some(lifecycle.to_string());
        self.timestamps.applied_unix_ms = Some(applied_unix_ms);
        self
    }

    pub fn with_validation_reject(mut self, reason: &str) -> Self {
        self.validation_rejected = Some(reason.to_string());
        self
    }
}

fn new_audit_id() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("aud_{}", &raw[..12])
}
