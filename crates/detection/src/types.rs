use features::{FeatureContext, FeatureVector};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DETECTOR_IDS: [DetectorId; 4] = [
    DetectorId::GradientStumps,
    DetectorId::Sequence,
    DetectorId::Isolation,
    DetectorId::Reconstruction,
];

/// The fixed detector roster. Heterogeneous on purpose: a supervised
/// classifier, a sequence-surprise model, a robust-deviation scorer, and a
/// reconstruction scorer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DetectorId {
    GradientStumps,
    Sequence,
    Isolation,
    Reconstruction,
}

impl DetectorId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GradientStumps => "gradient_stumps",
            Self::Sequence => "sequence",
            Self::Isolation => "isolation",
            Self::Reconstruction => "reconstruction",
        }
    }

    pub const fn index(&self) -> usize {
        match self {
            Self::GradientStumps => 0,
            Self::Sequence => 1,
            Self::Isolation => 2,
            Self::Reconstruction => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerdictLabel {
    Benign,
    Threat,
    Unknown,
}

impl VerdictLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Benign => "benign",
            Self::Threat => "threat",
            Self::Unknown => "unknown",
        }
    }
}

/// Per-slot contribution a detector can attach to its verdict, kept for
/// post-hoc explanation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureContribution {
    pub slot: usize,
    pub name: String,
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorVerdict {
    pub detector_id: DetectorId,
    /// Threat score in [0, 1].
    pub score: f64,
    pub label: VerdictLabel,
    pub confidence: f64,
    pub contributions: Option<Vec<FeatureContribution>>,
}

/// Combined output of the ensemble for one feature vector. Immutable.
/// `aggregate_score` is NaN exactly when every detector failed, in which
/// case the label is `Unknown` and downstream treats it as monitor-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub detection_id: String,
    pub context: FeatureContext,
    pub features: FeatureVector,
    pub verdicts: Vec<DetectorVerdict>,
    pub aggregate_score: f64,
    pub aggregate_label: VerdictLabel,
    pub decided_at_unix_ms: i64,
}

impl Detection {
    pub fn is_unknown(&self) -> bool {
        matches!(self.aggregate_label, VerdictLabel::Unknown)
    }
}

pub(crate) fn new_detection_id() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("det_{}", &raw[..12])
}
