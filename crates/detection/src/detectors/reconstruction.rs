use features::FeatureVector;

use crate::artifact::ReconstructionParams;
use crate::detectors::{check_input, Detector};
use crate::error::DetectorError;
use crate::types::{DetectorId, DetectorVerdict, VerdictLabel};

/// Reconstruction scorer: a linear autoencoder fitted on benign windows.
/// Encode projects the vector into a small latent space, decode maps it
/// back; traffic the encoder never saw reconstructs poorly and the
/// normalized reconstruction error becomes the threat score.
pub struct ReconstructionDetector {
    params: ReconstructionParams,
}

impl ReconstructionDetector {
    pub fn new(params: ReconstructionParams) -> Self {
        Self { params }
    }
}

impl Detector for ReconstructionDetector {
    fn id(&self) -> DetectorId {
        DetectorId::Reconstruction
    }

    fn predict(&self, features: &FeatureVector) -> Result<DetectorVerdict, DetectorError> {
        check_input(self.id(), features)?;

        let slots = &features.slots;
        let hidden = self.params.hidden;

        let mut latent = vec![0.0f64; hidden];
        for (h, row) in self.params.encode.iter().enumerate() {
            let mut sum = 0.0;
            for (value, weight) in slots.iter().zip(row.iter()) {
                sum += value * weight;
            }
            latent[h] = sum;
        }

        let mut mse = 0.0f64;
        for (slot, row) in self.params.decode.iter().enumerate() {
            let mut reconstructed = 0.0;
            for (z, weight) in latent.iter().zip(row.iter()) {
                reconstructed += z * weight;
            }
            let err = slots[slot] - reconstructed;
            mse += err * err;
        }
        mse /= slots.len() as f64;

        if !mse.is_finite() {
            return Err(DetectorError::Internal {
                detector: self.id(),
                message: "non-finite reconstruction error".to_string(),
            });
        }

        let tau = self.params.mse_threshold;
        let score = (mse / (2.0 * tau)).min(1.0);
        let distance = ((mse - tau).abs() / tau).min(1.0);

        Ok(DetectorVerdict {
            detector_id: self.id(),
            score,
            label: if mse > tau {
                VerdictLabel::Threat
            } else {
                VerdictLabel::Benign
            },
            confidence: (0.5 + distance * 0.5).min(1.0),
            contributions: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::EnsembleArtifact;
    use features::layout::slot;

    fn detector() -> ReconstructionDetector {
        ReconstructionDetector::new(EnsembleArtifact::default().reconstruction)
    }

    fn profile_vector() -> FeatureVector {
        let artifact = EnsembleArtifact::default();
        let mut features = FeatureVector::zeroed();
        for (index, median) in artifact.isolation.medians.iter().enumerate() {
            features.slots[index] = *median;
        }
        features
    }

    #[test]
    fn benign_profile_reconstructs_well() {
        let verdict = detector().predict(&profile_vector()).expect("predict");
        assert_eq!(verdict.label, VerdictLabel::Benign);
        assert!(verdict.score < 0.2, "score {}", verdict.score);
    }

    #[test]
    fn off_manifold_vector_reconstructs_poorly() {
        let mut features = FeatureVector::zeroed();
        features.slots[slot::SYN_RATIO] = 1.0;
        features.slots[slot::RECORD_COUNT] = 0.6;
        features.slots[slot::DST_PORT_ENTROPY] = 0.9;

        let verdict = detector().predict(&features).expect("predict");
        assert!(verdict.score > 0.4, "score {}", verdict.score);
    }
}
