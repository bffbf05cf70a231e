use features::FeatureVector;

use crate::artifact::SequenceParams;
use crate::detectors::{check_input, Detector};
use crate::error::DetectorError;
use crate::types::{DetectorId, DetectorVerdict, VerdictLabel};

/// Sequence-surprise model. The slot array is read as an ordered sequence:
/// each value is quantized to a level and the walk across adjacent slots is
/// scored against a transition matrix fitted on benign windows. Vectors
/// whose level transitions are improbable under that matrix score high.
pub struct SequenceDetector {
    params: SequenceParams,
    max_surprise: f64,
}

impl SequenceDetector {
    pub fn new(params: SequenceParams) -> Self {
        let max_surprise = -(params.floor_prob.ln());
        Self {
            params,
            max_surprise,
        }
    }

    fn level(&self, value: f64) -> usize {
        let levels = self.params.levels;
        let scaled = (value.clamp(0.0, 1.0) * levels as f64) as usize;
        scaled.min(levels - 1)
    }
}

impl Detector for SequenceDetector {
    fn id(&self) -> DetectorId {
        DetectorId::Sequence
    }

    fn predict(&self, features: &FeatureVector) -> Result<DetectorVerdict, DetectorError> {
        check_input(self.id(), features)?;

        let mut surprise_sum = 0.0;
        let mut steps = 0usize;
        let mut previous = self.level(features.slots[0]);
        for value in &features.slots[1..] {
            let current = self.level(*value);
            let p = self
                .params
                .transitions
                .get(previous)
                .and_then(|row| row.get(current))
                .copied()
                .unwrap_or(self.params.floor_prob)
                .max(self.params.floor_prob);
            surprise_sum += -(p.ln());
            steps += 1;
            previous = current;
        }

        if steps == 0 || self.max_surprise <= 0.0 {
            return Err(DetectorError::Internal {
                detector: self.id(),
                message: "degenerate sequence configuration".to_string(),
            });
        }

        let mean_surprise = surprise_sum / steps as f64;
        let score = (mean_surprise / self.max_surprise).clamp(0.0, 1.0);
        // Surprise is a soft signal; confidence grows away from the middle.
        let confidence = ((score - 0.5).abs() * 2.0).clamp(0.2, 1.0);

        Ok(DetectorVerdict {
            detector_id: self.id(),
            score,
            label: if score >= 0.5 {
                VerdictLabel::Threat
            } else {
                VerdictLabel::Benign
            },
            confidence,
            contributions: None,
        })
    }
}
