use std::fmt;

use crate::types::DetectorId;

#[derive(Debug)]
pub enum DetectorError {
    DimensionMismatch { detector: DetectorId, expected: usize, got: usize },
    NonFiniteInput { detector: DetectorId, slot: usize },
    Internal { detector: DetectorId, message: String },
}

impl DetectorError {
    pub fn detector(&self) -> DetectorId {
        match self {
            Self::DimensionMismatch { detector, .. } => *detector,
            Self::NonFiniteInput { detector, .. } => *detector,
            Self::Internal { detector, .. } => *detector,
        }
    }
}

impl fmt::Display for DetectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DimensionMismatch { detector, expected, got } => write!(
                f,
                "{}: dimension mismatch, expected {} slots, got {}",
                detector.as_str(),
                expected,
                got
            ),
            Self::NonFiniteInput { detector, slot } => {
                write!(f, "{}: non-finite input at slot {}", detector.as_str(), slot)
            }
            Self::Internal { detector, message } => {
                write!(f, "{}: {}", detector.as_str(), message)
            }
        }
    }
}

impl std::error::Error for DetectorError {}

/// Artifact loading/validation failures. All fatal at startup; a bad hot
/// reload leaves the previous snapshot in place.
#[derive(Debug)]
pub enum ArtifactError {
    Io(std::io::Error),
    ParseJson(serde_json::Error),
    SlotCountMismatch { expected: usize, got: usize },
    InvalidThreshold(f64),
    WeightSum(f64),
    MissingWeight(&'static str),
    NonFinite { field: &'static str },
    BadShape { field: &'static str },
    MajorVersionMismatch { expected: u32, got: u32 },
}

impl fmt::Display for ArtifactError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io error: {}", err),
            Self::ParseJson(err) => write!(f, "artifact json error: {}", err),
            Self::SlotCountMismatch { expected, got } => {
                write!(f, "artifact slot count {} does not match runtime {}", got, expected)
            }
            Self::InvalidThreshold(t) => write!(f, "threshold {} outside [0,1]", t),
            Self::WeightSum(sum) => write!(f, "ensemble weights sum to {}, expected 1.0", sum),
            Self::MissingWeight(name) => write!(f, "missing ensemble weight for {}", name),
            Self::NonFinite { field } => write!(f, "non-finite value in {}", field),
            Self::BadShape { field } => write!(f, "bad tensor shape in {}", field),
            Self::MajorVersionMismatch { expected, got } => {
                write!(f, "artifact major version {} incompatible with runtime {}", got, expected)
            }
        }
    }
}

impl std::error::Error for ArtifactError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::ParseJson(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ArtifactError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for ArtifactError {
    fn from(value: serde_json::Error) -> Self {
        Self::ParseJson(value)
    }
}
