mod isolation;
mod reconstruction;
mod sequence;
mod stumps;

pub use isolation::IsolationDetector;
pub use reconstruction::ReconstructionDetector;
pub use sequence::SequenceDetector;
pub use stumps::GradientStumpsDetector;

use features::{FeatureVector, FEATURE_SLOT_COUNT};

use crate::error::DetectorError;
use crate::types::{DetectorId, DetectorVerdict};

/// One detector in the ensemble. `predict` must be pure with respect to the
/// feature vector; anything stateful is warm-started from the artifact.
pub trait Detector: Send + Sync {
    fn id(&self) -> DetectorId;
    fn predict(&self, features: &FeatureVector) -> Result<DetectorVerdict, DetectorError>;
}

pub(crate) fn check_input(
    detector: DetectorId,
    features: &FeatureVector,
) -> Result<(), DetectorError> {
    if features.slots.len() != FEATURE_SLOT_COUNT {
        return Err(DetectorError::DimensionMismatch {
            detector,
            expected: FEATURE_SLOT_COUNT,
            got: features.slots.len(),
        });
    }
    for (slot, value) in features.slots.iter().enumerate() {
        if !value.is_finite() {
            return Err(DetectorError::NonFiniteInput { detector, slot });
        }
    }
    Ok(())
}
