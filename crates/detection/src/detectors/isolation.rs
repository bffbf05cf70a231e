use features::{layout, FeatureVector};

use crate::artifact::IsolationParams;
use crate::detectors::{check_input, Detector};
use crate::error::DetectorError;
use crate::types::{DetectorId, DetectorVerdict, FeatureContribution, VerdictLabel};

/// Robust-deviation anomaly scorer: per-slot z-scores against the artifact's
/// median/MAD profile, scored on the mean of the top-k deviations so a few
/// strongly anomalous slots dominate rather than being averaged away.
pub struct IsolationDetector {
    params: IsolationParams,
}

impl IsolationDetector {
    pub fn new(params: IsolationParams) -> Self {
        Self { params }
    }
}

impl Detector for IsolationDetector {
    fn id(&self) -> DetectorId {
        DetectorId::Isolation
    }

    fn predict(&self, features: &FeatureVector) -> Result<DetectorVerdict, DetectorError> {
        check_input(self.id(), features)?;

        let mut deviations: Vec<(usize, f64)> = Vec::with_capacity(features.slots.len());
        for (slot, value) in features.slots.iter().enumerate() {
            let median = self.params.medians.get(slot).copied().unwrap_or(0.0);
            let mad = self.params.mads.get(slot).copied().unwrap_or(0.1).max(1e-6);
            // 1.4826 rescales MAD to the stddev of a normal distribution.
            let z = ((value - median) / (1.4826 * mad)).abs();
            deviations.push((slot, (z / self.params.z_cap).min(1.0)));
        }

        deviations.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let top_k = self.params.top_k.min(deviations.len()).max(1);
        let score: f64 =
            deviations.iter().take(top_k).map(|(_, z)| z).sum::<f64>() / top_k as f64;

        let contributions = deviations
            .iter()
            .take(top_k)
            .filter(|(_, z)| *z > 0.0)
            .map(|(slot, z)| FeatureContribution {
                slot: *slot,
                name: layout::slot_name(*slot).to_string(),
                weight: *z,
            })
            .collect();

        Ok(DetectorVerdict {
            detector_id: self.id(),
            score,
            label: if score >= 0.5 {
                VerdictLabel::Threat
            } else {
                VerdictLabel::Benign
            },
            confidence: score.clamp(0.0, 1.0),
            contributions: Some(contributions),
        })
    }
}
