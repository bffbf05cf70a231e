//! Policy artifact: the trained action-scoring head. At runtime the policy
//! is a deterministic linear scorer per action over the bounded state
//! vector; training (and its reward shaping) happens entirely offline.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::action::{Action, ACTION_SET};
use crate::error::AgentError;
use crate::state::{StateVector, STATE_SLOT_COUNT};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyArtifact {
    pub agent_id: String,
    pub artifact_version: String,
    pub state_slot_count: usize,
    /// One weight row per action, in `ACTION_SET` order.
    pub action_weights: Vec<Vec<f64>>,
    pub action_bias: Vec<f64>,
}

impl PolicyArtifact {
    pub fn from_json(json: &str) -> Result<Self, AgentError> {
        let artifact: Self =
            serde_json::from_str(json).map_err(|e| AgentError::BadArtifact(e.to_string()))?;
        artifact.validate()?;
        Ok(artifact)
    }

    pub fn from_file(path: &Path) -> Result<Self, AgentError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| AgentError::BadArtifact(e.to_string()))?;
        Self::from_json(&content)
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.state_slot_count != STATE_SLOT_COUNT {
            return Err(AgentError::BadArtifact(format!(
                "state slot count {} does not match runtime {}",
                self.state_slot_count, STATE_SLOT_COUNT
            )));
        }
        if self.action_weights.len() != ACTION_SET.len()
            || self.action_bias.len() != ACTION_SET.len()
        {
            return Err(AgentError::BadArtifact(format!(
                "expected {} action rows, got {} weights / {} biases",
                ACTION_SET.len(),
                self.action_weights.len(),
                self.action_bias.len()
            )));
        }
        for row in &self.action_weights {
            if row.len() != STATE_SLOT_COUNT {
                return Err(AgentError::BadArtifact(
                    "action weight row length mismatch".to_string(),
                ));
            }
            if row.iter().any(|w| !w.is_finite()) {
                return Err(AgentError::BadArtifact(
                    "non-finite action weight".to_string(),
                ));
            }
        }
        if self.action_bias.iter().any(|b| !b.is_finite()) {
            return Err(AgentError::BadArtifact("non-finite action bias".to_string()));
        }
        Ok(())
    }

    /// Raw per-action scores for a state, in `ACTION_SET` order.
    pub fn score_actions(&self, state: &StateVector) -> [f64; ACTION_SET.len()] {
        let mut scores = [0.0f64; ACTION_SET.len()];
        for (index, (row, bias)) in self
            .action_weights
            .iter()
            .zip(self.action_bias.iter())
            .enumerate()
        {
            let mut sum = *bias;
            for (value, weight) in state.slots.iter().zip(row.iter()) {
                sum += value * weight;
            }
            scores[index] = sum;
        }
        scores
    }
}

/// The built-in head used when no artifact file is configured. Weight rows
/// are in `ACTION_SET` order over the documented state slots:
/// threat, reputation, criticality, volume, proto risk, time risk,
/// history, internal, port sensitivity, frequency, payload, geo.
impl Default for PolicyArtifact {
    fn default() -> Self {
        let action_weights = vec![
            // allow: collapses as threat rises
            vec![-3.0, 0.4, 0.0, 0.0, 0.0, 0.0, -0.3, 0.3, 0.0, 0.0, 0.0, 0.0],
            // deny: threat plus sensitive targets
            vec![4.0, -0.3, 0.5, 0.0, 0.2, 0.2, 0.4, 0.0, 0.5, 0.0, 0.3, 0.2],
            // rate_limit low
            vec![1.5, 0.0, 0.0, 0.3, 0.0, 0.0, 0.0, 0.0, 0.0, 0.3, 0.0, 0.0],
            // rate_limit med
            vec![2.5, 0.0, 0.0, 0.5, 0.0, 0.0, 0.2, 0.0, 0.2, 1.0, 0.0, 0.0],
            // rate_limit high: volume-heavy attacks
            vec![3.0, 0.0, 0.0, 1.5, 0.0, 0.0, 0.0, -0.5, 0.0, 1.0, 0.0, 0.0],
            // quarantine short: repeat offenders on critical assets
            vec![3.5, -0.5, 1.0, 0.0, 0.0, 0.3, 1.5, 0.0, 0.3, 0.0, 0.5, 0.3],
            // quarantine long: persistent, well-known-bad sources
            vec![3.0, -1.0, 0.8, 0.0, 0.0, 0.0, 2.5, 0.0, 0.0, 0.0, 0.5, 0.5],
            // monitor: the default posture under uncertainty
            vec![1.0, 0.0, 0.0, 0.0, 0.2, 0.3, 0.0, 0.2, 0.0, 0.0, 0.0, 0.0],
        ];
        let action_bias = vec![1.2, -2.4, -0.9, -1.3, -2.0, -3.0, -3.5, -0.2];

        Self {
            agent_id: "policy-head-default".to_string(),
            artifact_version: "1.2.0".to_string(),
            state_slot_count: STATE_SLOT_COUNT,
            action_weights,
            action_bias,
        }
    }
}

/// Validity mask over actions for a given state. Some actions are never
/// reasonable in some states regardless of what the head prefers.
pub fn action_mask(state: &StateVector) -> [bool; ACTION_SET.len()] {
    let mut mask = [true; ACTION_SET.len()];
    let threat = state.threat_score();

    if threat > 0.95 {
        mask[Action::Allow.index()] = false;
    }
    if threat < 0.5 {
        mask[Action::Quarantine(crate::action::QuarantineSpan::Long).index()] = false;
    }
    if state.is_internal() {
        mask[Action::RateLimit(crate::action::RateTier::High).index()] = false;
    }
    // Monitor is always a legal outcome.
    mask[Action::Monitor.index()] = true;
    mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_artifact_validates() {
        PolicyArtifact::default().validate().expect("default artifact");
    }

    #[test]
    fn round_trips_through_json() {
        let artifact = PolicyArtifact::default();
        let json = serde_json::to_string(&artifact).expect("serialize");
        let loaded = PolicyArtifact::from_json(&json).expect("load");
        assert_eq!(loaded.agent_id, artifact.agent_id);
    }

    #[test]
    fn rejects_row_shape_mismatch() {
        let mut artifact = PolicyArtifact::default();
        artifact.action_weights[2].pop();
        assert!(artifact.validate().is_err());
    }

    #[test]
    fn mask_blocks_allow_at_extreme_threat() {
        let mut state = StateVector {
            slots: [0.0; STATE_SLOT_COUNT],
        };
        state.slots[0] = 0.97;
        let mask = action_mask(&state);
        assert!(!mask[Action::Allow.index()]);
        assert!(mask[Action::Monitor.index()]);
    }

    #[test]
    fn mask_blocks_long_quarantine_for_low_threat() {
        let mut state = StateVector {
            slots: [0.0; STATE_SLOT_COUNT],
        };
        state.slots[0] = 0.3;
        let mask = action_mask(&state);
        assert!(!mask[Action::Quarantine(crate::action::QuarantineSpan::Long).index()]);
    }
}
