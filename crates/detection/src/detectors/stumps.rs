use features::{layout, FeatureVector};

use crate::artifact::StumpsParams;
use crate::detectors::{check_input, Detector};
use crate::error::DetectorError;
use crate::types::{DetectorId, DetectorVerdict, FeatureContribution, VerdictLabel};

/// Supervised classifier: additive decision stumps over individual slots,
/// squashed through a logistic. The per-stump margins double as the
/// contribution breakdown.
pub struct GradientStumpsDetector {
    params: StumpsParams,
}

impl GradientStumpsDetector {
    pub fn new(params: StumpsParams) -> Self {
        Self { params }
    }
}

impl Detector for GradientStumpsDetector {
    fn id(&self) -> DetectorId {
        DetectorId::GradientStumps
    }

    fn predict(&self, features: &FeatureVector) -> Result<DetectorVerdict, DetectorError> {
        check_input(self.id(), features)?;

        let mut logit = self.params.bias;
        let mut contributions = Vec::with_capacity(self.params.stumps.len());
        for stump in &self.params.stumps {
            let value = features.get(stump.slot);
            let margin = if value >= stump.split {
                stump.above
            } else {
                stump.below
            };
            logit += margin;
            if margin != 0.0 {
                contributions.push(FeatureContribution {
                    slot: stump.slot,
                    name: layout::slot_name(stump.slot).to_string(),
                    weight: margin,
                });
            }
        }

        let score = sigmoid(logit);
        let label = if score >= 0.5 {
            VerdictLabel::Threat
        } else {
            VerdictLabel::Benign
        };

        Ok(DetectorVerdict {
            detector_id: self.id(),
            score,
            label,
            confidence: (2.0 * score - 1.0).abs(),
            contributions: Some(contributions),
        })
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::EnsembleArtifact;
    use features::layout::slot;

    fn detector() -> GradientStumpsDetector {
        GradientStumpsDetector::new(EnsembleArtifact::default().gradient_stumps)
    }

    #[test]
    fn syn_heavy_vector_scores_threat() {
        let mut features = FeatureVector::zeroed();
        features.slots[slot::SYN_RATIO] = 0.95;
        features.slots[slot::RECORD_COUNT] = 0.2;

        let verdict = detector().predict(&features).expect("predict");
        assert!(verdict.score > 0.7, "score {}", verdict.score);
        assert_eq!(verdict.label, VerdictLabel::Threat);
        let contributions = verdict.contributions.expect("contributions");
        assert!(contributions.iter().any(|c| c.slot == slot::SYN_RATIO && c.weight > 0.0));
    }

    #[test]
    fn ack_heavy_vector_scores_benign() {
        let mut features = FeatureVector::zeroed();
        features.slots[slot::ACK_RATIO] = 0.9;
        features.slots[slot::SYN_RATIO] = 0.05;

        let verdict = detector().predict(&features).expect("predict");
        assert!(verdict.score < 0.3, "score {}", verdict.score);
        assert_eq!(verdict.label, VerdictLabel::Benign);
    }

    #[test]
    fn rejects_non_finite_input() {
        let mut features = FeatureVector::zeroed();
        features.slots[3] = f64::NAN;
        assert!(matches!(
            detector().predict(&features),
            Err(DetectorError::NonFiniteInput { slot: 3, .. })
        ));
    }
}
