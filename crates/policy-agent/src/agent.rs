use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use detection::{Detection, VerdictLabel};
use ingest::Protocol;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::action::{Action, RateTier, ACTION_SET};
use crate::artifact::{action_mask, PolicyArtifact};
use crate::error::AgentError;
use crate::state::{build_state, DecisionContext, StateVector};

/// Score thresholds for the fallback rule table, used when the learned head
/// is absent or rejects the state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackThresholds {
    pub high: f64,
    pub medium: f64,
}

impl Default for FallbackThresholds {
    fn default() -> Self {
        Self {
            high: 0.8,
            medium: 0.5,
        }
    }
}

/// The enforcement decision for one detection. Carries the offending
/// source context so downstream stages need no lookback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub decision_id: String,
    pub detection_id: String,
    pub action: Action,
    pub confidence: f64,
    pub agent_id: String,
    pub fallback_used: bool,
    pub decided_at_unix_ms: i64,
    pub src_addr: IpAddr,
    pub dst_port: u16,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, Default)]
pub struct AgentCounters {
    pub decided: u64,
    pub fallback_used: u64,
    pub unknown_monitor: u64,
}

/// Maps detections to enforcement actions. Deterministic given the loaded
/// artifact and the input state; with no artifact the fallback table runs.
pub struct PolicyAgent {
    artifact: Option<Arc<PolicyArtifact>>,
    thresholds: FallbackThresholds,
    agent_id: String,
}

impl PolicyAgent {
    pub fn new(artifact: Option<PolicyArtifact>, thresholds: FallbackThresholds) -> Self {
        let agent_id = artifact
            .as_ref()
            .map(|a| a.agent_id.clone())
            .unwrap_or_else(|| "fallback-table".to_string());
        Self {
            artifact: artifact.map(Arc::new),
            thresholds,
            agent_id,
        }
    }

    pub fn with_default_artifact() -> Self {
        Self::new(Some(PolicyArtifact::default()), FallbackThresholds::default())
    }

    /// Load from a configured path. A missing file is not fatal: the agent
    /// runs on the fallback table and says so once.
    pub fn from_path(path: &Path, thresholds: FallbackThresholds) -> Result<Self, AgentError> {
        if !path.exists() {
            warn!(path = %path.display(), "policy artifact not found; using fallback rule table");
            return Ok(Self::new(None, thresholds));
        }
        let artifact = PolicyArtifact::from_file(path)?;
        info!(agent_id = %artifact.agent_id, version = %artifact.artifact_version, "policy artifact loaded");
        Ok(Self::new(Some(artifact), thresholds))
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Decide an action for a detection. Never fails: every error path
    /// lands in the fallback table, and unknown detections are always
    /// monitor-only.
    pub fn decide(
        &self,
        detection: &Detection,
        context: &DecisionContext,
        counters: &mut AgentCounters,
    ) -> Decision {
        let state = build_state(detection, context);

        let (action, confidence, fallback_used) =
            if matches!(detection.aggregate_label, VerdictLabel::Unknown) {
                counters.unknown_monitor = counters.unknown_monitor.saturating_add(1);
                (Action::Monitor, 1.0, true)
            } else if let Some(artifact) = &self.artifact {
                let (action, confidence) = decide_learned(artifact, &state);
                (action, confidence, false)
            } else {
                let (action, confidence) = self.decide_fallback(detection.aggregate_score);
                (action, confidence, true)
            };

        if fallback_used {
            counters.fallback_used = counters.fallback_used.saturating_add(1);
        }
        counters.decided = counters.decided.saturating_add(1);

        Decision {
            decision_id: new_decision_id(),
            detection_id: detection.detection_id.clone(),
            action,
            confidence,
            agent_id: self.agent_id.clone(),
            fallback_used,
            decided_at_unix_ms: detection.decided_at_unix_ms,
            src_addr: detection.context.key_addr,
            dst_port: detection.context.top_dst_port,
            protocol: detection.context.protocol,
        }
    }

    /// Static rule table keyed on the aggregate score.
    fn decide_fallback(&self, aggregate_score: f64) -> (Action, f64) {
        if !aggregate_score.is_finite() {
            return (Action::Monitor, 1.0);
        }
        if aggregate_score >= self.thresholds.high {
            (Action::Deny, aggregate_score.clamp(0.0, 1.0))
        } else if aggregate_score >= self.thresholds.medium {
            (Action::RateLimit(RateTier::Med), aggregate_score.clamp(0.0, 1.0))
        } else {
            (Action::Monitor, (1.0 - aggregate_score).clamp(0.0, 1.0))
        }
    }
}

/// Masked argmax over the learned per-action scores, with confidence from
/// the softmax mass of the winner. Ties break toward the earlier action in
/// `ACTION_SET`, which keeps the mapping deterministic.
fn decide_learned(artifact: &PolicyArtifact, state: &StateVector) -> (Action, f64) {
    let scores = artifact.score_actions(state);
    let mask = action_mask(state);

    let mut best: Option<(usize, f64)> = None;
    for (index, score) in scores.iter().enumerate() {
        if !mask[index] {
            continue;
        }
        match best {
            Some((_, best_score)) if *score <= best_score => {}
            _ => best = Some((index, *score)),
        }
    }
    // The mask always leaves monitor legal.
    let (winner, winner_score) = best.unwrap_or((Action::Monitor.index(), 0.0));

    let mut mass = 0.0f64;
    let mut winner_mass = 0.0f64;
    for (index, score) in scores.iter().enumerate() {
        if !mask[index] {
            continue;
        }
        let weight = (score - winner_score).exp();
        mass += weight;
        if index == winner {
            winner_mass = weight;
        }
    }
    let confidence = if mass > 0.0 { winner_mass / mass } else { 0.0 };

    (ACTION_SET[winner], confidence)
}

fn new_decision_id() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("dec_{}", &raw[..12])
}
