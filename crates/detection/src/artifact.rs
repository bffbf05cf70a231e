//! Detection artifact: detector parameters, ensemble weights, and the
//! decision threshold, trained offline and shipped as a single JSON file.
//! The runtime only does inference; a reload validates the whole file and
//! swaps one snapshot pointer, never a partial update.

use std::path::Path;

use serde::{Deserialize, Serialize};

use features::FEATURE_SLOT_COUNT;

use crate::error::ArtifactError;

/// Major version the runtime understands. Bumped whenever the feature slot
/// layout changes; artifacts trained against another major are rejected.
pub const SUPPORTED_MAJOR_VERSION: u32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleArtifact {
    /// `major.minor.patch`; major must match `SUPPORTED_MAJOR_VERSION`.
    pub artifact_version: String,
    pub feature_slot_count: usize,
    pub threshold: f64,
    pub weights: EnsembleWeights,
    pub gradient_stumps: StumpsParams,
    pub sequence: SequenceParams,
    pub isolation: IsolationParams,
    pub reconstruction: ReconstructionParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleWeights {
    pub gradient_stumps: f64,
    pub sequence: f64,
    pub isolation: f64,
    pub reconstruction: f64,
}

impl EnsembleWeights {
    pub fn as_array(&self) -> [f64; 4] {
        [
            self.gradient_stumps,
            self.sequence,
            self.isolation,
            self.reconstruction,
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stump {
    pub slot: usize,
    pub split: f64,
    pub below: f64,
    pub above: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StumpsParams {
    pub stumps: Vec<Stump>,
    pub bias: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceParams {
    /// Quantization levels for slot values; transition matrix is levels².
    pub levels: usize,
    pub transitions: Vec<Vec<f64>>,
    pub floor_prob: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationParams {
    pub medians: Vec<f64>,
    pub mads: Vec<f64>,
    pub z_cap: f64,
    /// How many of the largest deviations feed the score.
    pub top_k: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconstructionParams {
    pub hidden: usize,
    /// `hidden x slot_count`.
    pub encode: Vec<Vec<f64>>,
    /// `slot_count x hidden`.
    pub decode: Vec<Vec<f64>>,
    pub mse_threshold: f64,
}

impl EnsembleArtifact {
    pub fn from_json(json: &str) -> Result<Self, ArtifactError> {
        let artifact: Self = serde_json::from_str(json)?;
        artifact.validate()?;
        Ok(artifact)
    }

    pub fn from_file(path: &Path) -> Result<Self, ArtifactError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn major_version(&self) -> u32 {
        self.artifact_version
            .split('.')
            .next()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn validate(&self) -> Result<(), ArtifactError> {
        let major = self.major_version();
        if major != SUPPORTED_MAJOR_VERSION {
            return Err(ArtifactError::MajorVersionMismatch {
                expected: SUPPORTED_MAJOR_VERSION,
                got: major,
            });
        }
        if self.feature_slot_count != FEATURE_SLOT_COUNT {
            return Err(ArtifactError::SlotCountMismatch {
                expected: FEATURE_SLOT_COUNT,
                got: self.feature_slot_count,
            });
        }
        if !(0.0..=1.0).contains(&self.threshold) || !self.threshold.is_finite() {
            return Err(ArtifactError::InvalidThreshold(self.threshold));
        }

        let weights = self.weights.as_array();
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ArtifactError::NonFinite { field: "weights" });
        }
        let sum: f64 = weights.iter().sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(ArtifactError::WeightSum(sum));
        }

        for stump in &self.gradient_stumps.stumps {
            if stump.slot >= FEATURE_SLOT_COUNT {
                return Err(ArtifactError::BadShape {
                    field: "gradient_stumps.stumps",
                });
            }
            if !stump.split.is_finite() || !stump.below.is_finite() || !stump.above.is_finite() {
                return Err(ArtifactError::NonFinite {
                    field: "gradient_stumps.stumps",
                });
            }
        }
        if !self.gradient_stumps.bias.is_finite() {
            return Err(ArtifactError::NonFinite {
                field: "gradient_stumps.bias",
            });
        }

        let levels = self.sequence.levels;
        if levels < 2 || self.sequence.transitions.len() != levels {
            return Err(ArtifactError::BadShape {
                field: "sequence.transitions",
            });
        }
        for row in &self.sequence.transitions {
            if row.len() != levels {
                return Err(ArtifactError::BadShape {
                    field: "sequence.transitions",
                });
            }
            if row.iter().any(|p| !p.is_finite() || *p < 0.0 || *p > 1.0) {
                return Err(ArtifactError::NonFinite {
                    field: "sequence.transitions",
                });
            }
        }
        if !(self.sequence.floor_prob > 0.0 && self.sequence.floor_prob < 1.0) {
            return Err(ArtifactError::NonFinite {
                field: "sequence.floor_prob",
            });
        }

        if self.isolation.medians.len() != FEATURE_SLOT_COUNT
            || self.isolation.mads.len() != FEATURE_SLOT_COUNT
        {
            return Err(ArtifactError::BadShape { field: "isolation" });
        }
        if self.isolation.z_cap <= 0.0 || !self.isolation.z_cap.is_finite() {
            return Err(ArtifactError::NonFinite {
                field: "isolation.z_cap",
            });
        }
        if self.isolation.top_k == 0 || self.isolation.top_k > FEATURE_SLOT_COUNT {
            return Err(ArtifactError::BadShape {
                field: "isolation.top_k",
            });
        }

        let hidden = self.reconstruction.hidden;
        if hidden == 0
            || self.reconstruction.encode.len() != hidden
            || self.reconstruction.decode.len() != FEATURE_SLOT_COUNT
        {
            return Err(ArtifactError::BadShape {
                field: "reconstruction",
            });
        }
        if self
            .reconstruction
            .encode
            .iter()
            .any(|row| row.len() != FEATURE_SLOT_COUNT)
            || self
                .reconstruction
                .decode
                .iter()
                .any(|row| row.len() != hidden)
        {
            return Err(ArtifactError::BadShape {
                field: "reconstruction",
            });
        }
        if self.reconstruction.mse_threshold <= 0.0
            || !self.reconstruction.mse_threshold.is_finite()
        {
            return Err(ArtifactError::NonFinite {
                field: "reconstruction.mse_threshold",
            });
        }

        Ok(())
    }
}

/// Baseline benign slot profile shared by the default isolation and
/// reconstruction parameters: what an unremarkable per-source window looks
/// like after normalization.
const BENIGN_PROFILE: [f64; FEATURE_SLOT_COUNT] = [
    0.02, 0.01, 0.01, 0.35, 0.01, 0.005, 0.01, 0.01, 0.60, 0.55, 0.05, 0.85, 0.05, 0.02, 0.30,
    0.00, 0.30, 0.20, 0.02, 0.05, 0.10, 0.08, 0.70, 0.60,
];

const BENIGN_MADS: [f64; FEATURE_SLOT_COUNT] = [
    0.02, 0.01, 0.01, 0.15, 0.01, 0.005, 0.01, 0.01, 0.15, 0.15, 0.05, 0.12, 0.05, 0.03, 0.15,
    0.01, 0.15, 0.10, 0.02, 0.05, 0.08, 0.06, 0.20, 0.20,
];

/// Built-in artifact used when no file is configured. The parameters mirror
/// the shipped training pipeline's output on the bootstrap traffic corpus.
impl Default for EnsembleArtifact {
    fn default() -> Self {
        use features::layout::slot;

        let profile: Vec<f64> = BENIGN_PROFILE.to_vec();
        let norm_sq: f64 = profile.iter().map(|v| v * v).sum();
        let encode_row: Vec<f64> = profile.iter().map(|v| v / norm_sq.max(1e-9)).collect();
        let decode: Vec<Vec<f64>> = profile.iter().map(|v| vec![*v]).collect();

        Self {
            artifact_version: "2.3.1".to_string(),
            feature_slot_count: FEATURE_SLOT_COUNT,
            threshold: 0.60,
            weights: EnsembleWeights {
                gradient_stumps: 0.35,
                sequence: 0.25,
                isolation: 0.20,
                reconstruction: 0.20,
            },
            gradient_stumps: StumpsParams {
                stumps: vec![
                    Stump { slot: slot::SYN_RATIO, split: 0.50, below: -0.6, above: 2.8 },
                    Stump { slot: slot::RECORD_COUNT, split: 0.08, below: -0.3, above: 1.2 },
                    Stump { slot: slot::RST_RATIO, split: 0.30, below: 0.0, above: 1.0 },
                    Stump { slot: slot::DST_PORT_ENTROPY, split: 0.70, below: 0.0, above: 0.9 },
                    Stump { slot: slot::PACKET_RATE, split: 0.05, below: -0.2, above: 0.8 },
                    Stump { slot: slot::ACK_RATIO, split: 0.60, below: 0.3, above: -0.8 },
                    Stump { slot: slot::UNIQUE_DST_PORTS, split: 0.25, below: 0.0, above: 0.7 },
                ],
                bias: -1.8,
            },
            sequence: SequenceParams {
                levels: 4,
                transitions: vec![
                    vec![0.85, 0.10, 0.03, 0.02],
                    vec![0.30, 0.40, 0.20, 0.10],
                    vec![0.10, 0.25, 0.40, 0.25],
                    vec![0.05, 0.15, 0.30, 0.50],
                ],
                floor_prob: 0.01,
            },
            isolation: IsolationParams {
                medians: BENIGN_PROFILE.to_vec(),
                mads: BENIGN_MADS.to_vec(),
                z_cap: 6.0,
                top_k: 4,
            },
            reconstruction: ReconstructionParams {
                hidden: 1,
                encode: vec![encode_row],
                decode,
                mse_threshold: 0.02,
            },
        }
    }
}
