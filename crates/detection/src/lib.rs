//! Detection ensemble: heterogeneous detectors over feature vectors,
//! combined by weighted stacking into a single threat verdict. Detector
//! parameters, weights, and the decision threshold come from a single
//! artifact loaded at startup and hot-swappable as one snapshot.

mod artifact;
mod detectors;
mod ensemble;
mod error;
mod types;

pub use artifact::{
    EnsembleArtifact, EnsembleWeights, IsolationParams, ReconstructionParams, SequenceParams,
    Stump, StumpsParams, SUPPORTED_MAJOR_VERSION,
};
pub use detectors::{
    Detector, GradientStumpsDetector, IsolationDetector, ReconstructionDetector, SequenceDetector,
};
pub use ensemble::{Ensemble, EnsembleCounters, EnsembleSnapshot, SlotPhase};
pub use error::{ArtifactError, DetectorError};
pub use types::{
    Detection, DetectorId, DetectorVerdict, FeatureContribution, VerdictLabel, DETECTOR_IDS,
};
