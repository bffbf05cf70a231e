use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use adapters::UniversalRule;
use audit::AuditRecord;
use detection::{Detection, Ensemble, EnsembleCounters};
use features::{FeatureContext, FeatureFrame, WindowAggregates, WindowKind};
use ingest::CommonRecord;
use orchestrator::{
    ApplyReport, DecisionOutcome, OrchestratorCounters, RuleLifecycle, RuleRecord,
};
use policy_agent::{AgentCounters, Decision, DecisionContext, PolicyAgent};
use uuid::Uuid;

use crate::pipeline::now_unix_ms;

/// Commands from the synchronous surfaces into the control task, which
/// owns the orchestrator and the audit store.
pub enum ControlCommand {
    Apply {
        detection: Option<Detection>,
        decision: Decision,
        resp: oneshot::Sender<DecisionOutcome>,
    },
    ApplyRule {
        rule: UniversalRule,
        resp: oneshot::Sender<DecisionOutcome>,
    },
    Rollback {
        rule_id: String,
        resp: oneshot::Sender<Option<ApplyReport>>,
    },
    RollbackByDecision {
        decision_id: String,
        resp: oneshot::Sender<Option<ApplyReport>>,
    },
    ListRules {
        lifecycle: Option<RuleLifecycle>,
        resp: oneshot::Sender<Vec<RuleRecord>>,
    },
    AuditByDetection {
        detection_id: String,
        resp: oneshot::Sender<Vec<AuditRecord>>,
    },
    AuditByRule {
        rule_id: String,
        resp: oneshot::Sender<Vec<AuditRecord>>,
    },
    Counters {
        resp: oneshot::Sender<OrchestratorCounters>,
    },
}

#[derive(Debug)]
pub enum ServiceError {
    Busy,
    Closed,
    DeadlineElapsed,
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => write!(f, "pipeline busy"),
            Self::Closed => write!(f, "pipeline stopped"),
            Self::DeadlineElapsed => write!(f, "request deadline elapsed"),
        }
    }
}

impl std::error::Error for ServiceError {}

/// One-shot surfaces that bypass ingestion and windowing: score a single
/// vector or record, decide, apply, roll back, inspect rules and audit.
#[derive(Clone)]
pub struct PipelineService {
    ensemble: Arc<Ensemble>,
    agent: Arc<PolicyAgent>,
    context: DecisionContext,
    control_tx: mpsc::Sender<ControlCommand>,
    budget_ms: u64,
}

impl PipelineService {
    pub(crate) fn new(
        ensemble: Arc<Ensemble>,
        agent: Arc<PolicyAgent>,
        context: DecisionContext,
        control_tx: mpsc::Sender<ControlCommand>,
        budget_ms: u64,
    ) -> Self {
        Self {
            ensemble,
            agent,
            context,
            control_tx,
            budget_ms,
        }
    }

    /// Score one already-built feature frame. Returns `Unknown` on full
    /// detector outage, same as the hot path.
    pub fn detect(&self, frame: &FeatureFrame) -> Detection {
        let mut counters = EnsembleCounters::default();
        self.ensemble.score(frame, now_unix_ms(), &mut counters)
    }

    /// Score one raw record: it becomes a single-record window and goes
    /// through the same detectors.
    pub fn detect_record(&self, record: &CommonRecord) -> Detection {
        let mut aggregates = WindowAggregates::new(64);
        aggregates.observe(record);
        let span = record.duration_ms().max(1_000);
        let vector = aggregates.finalize(span);

        let raw = Uuid::new_v4().simple().to_string();
        let frame = FeatureFrame {
            vector,
            context: FeatureContext {
                vector_id: format!("fv_{}", &raw[..12]),
                window_key: record.tuple.src_addr.to_string(),
                window_kind: WindowKind::Tumbling,
                window_start_unix_ms: record.t_start_unix_ms,
                window_end_unix_ms: record.t_end_unix_ms,
                record_count: 1,
                key_addr: record.tuple.src_addr,
                key_dst_port: None,
                top_dst_port: record.tuple.dst_port,
                protocol: record.tuple.protocol,
            },
        };
        self.detect(&frame)
    }

    pub fn decide(&self, detection: &Detection) -> Decision {
        let mut counters = AgentCounters::default();
        self.agent.decide(detection, &self.context, &mut counters)
    }

    /// Apply a decision through the orchestrator. Pass the detection when
    /// available so the audit record is complete.
    pub async fn apply(
        &self,
        detection: Option<Detection>,
        decision: Decision,
    ) -> Result<DecisionOutcome, ServiceError> {
        self.round_trip(|resp| ControlCommand::Apply {
            detection,
            decision,
            resp,
        })
        .await
    }

    /// Submit an externally-constructed rule (pinned allow, manual
    /// monitor) into validation, conflict resolution, and dispatch.
    pub async fn apply_rule(&self, rule: UniversalRule) -> Result<DecisionOutcome, ServiceError> {
        self.round_trip(|resp| ControlCommand::ApplyRule { rule, resp }).await
    }

    pub async fn rollback(&self, rule_id: &str) -> Result<Option<ApplyReport>, ServiceError> {
        let rule_id = rule_id.to_string();
        self.round_trip(|resp| ControlCommand::Rollback { rule_id, resp })
            .await
    }

    pub async fn rollback_by_decision(
        &self,
        decision_id: &str,
    ) -> Result<Option<ApplyReport>, ServiceError> {
        let decision_id = decision_id.to_string();
        self.round_trip(|resp| ControlCommand::RollbackByDecision { decision_id, resp })
            .await
    }

    pub async fn list_rules(
        &self,
        lifecycle: Option<RuleLifecycle>,
    ) -> Result<Vec<RuleRecord>, ServiceError> {
        self.round_trip(|resp| ControlCommand::ListRules { lifecycle, resp })
            .await
    }

    pub async fn audit_by_detection(
        &self,
        detection_id: &str,
    ) -> Result<Vec<AuditRecord>, ServiceError> {
        let detection_id = detection_id.to_string();
        self.round_trip(|resp| ControlCommand::AuditByDetection { detection_id, resp })
            .await
    }

    pub async fn audit_by_rule(&self, rule_id: &str) -> Result<Vec<AuditRecord>, ServiceError> {
        let rule_id = rule_id.to_string();
        self.round_trip(|resp| ControlCommand::AuditByRule { rule_id, resp })
            .await
    }

    pub async fn orchestrator_counters(&self) -> Result<OrchestratorCounters, ServiceError> {
        self.round_trip(|resp| ControlCommand::Counters { resp }).await
    }

    async fn round_trip<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ControlCommand,
    ) -> Result<T, ServiceError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.control_tx
            .try_send(build(resp_tx))
            .map_err(|error| match error {
                mpsc::error::TrySendError::Full(_) => ServiceError::Busy,
                mpsc::error::TrySendError::Closed(_) => ServiceError::Closed,
            })?;
        match timeout(Duration::from_millis(self.budget_ms.max(1)), resp_rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(ServiceError::Closed),
            Err(_) => Err(ServiceError::DeadlineElapsed),
        }
    }
}
