use std::sync::{Arc, RwLock};

use features::FeatureFrame;
use tracing::{info, warn};

use crate::artifact::EnsembleArtifact;
use crate::detectors::{
    Detector, GradientStumpsDetector, IsolationDetector, ReconstructionDetector, SequenceDetector,
};
use crate::error::ArtifactError;
use crate::types::{new_detection_id, Detection, DetectorVerdict, VerdictLabel};

/// Progress of one scoring slot. Partial detector failure detours through
/// `Degraded` but still emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPhase {
    Idle,
    Scoring,
    Combining,
    Degraded,
    Emitted,
}

#[derive(Debug, Clone, Default)]
pub struct EnsembleCounters {
    pub scored: u64,
    pub detector_failures: [u64; 4],
    pub degraded: u64,
    pub unknown_emitted: u64,
}

/// Everything derived from one artifact load. Immutable; hot reload swaps
/// the snapshot pointer atomically, never patches in place.
pub struct EnsembleSnapshot {
    pub artifact_version: String,
    pub threshold: f64,
    weights: [f64; 4],
    detectors: Vec<Box<dyn Detector>>,
}

impl EnsembleSnapshot {
    fn build(artifact: EnsembleArtifact) -> Self {
        let weights = artifact.weights.as_array();
        let detectors: Vec<Box<dyn Detector>> = vec![
            Box::new(GradientStumpsDetector::new(artifact.gradient_stumps)),
            Box::new(SequenceDetector::new(artifact.sequence)),
            Box::new(IsolationDetector::new(artifact.isolation)),
            Box::new(ReconstructionDetector::new(artifact.reconstruction)),
        ];
        Self {
            artifact_version: artifact.artifact_version,
            threshold: artifact.threshold,
            weights,
            detectors,
        }
    }
}

/// The detection ensemble: N heterogeneous detectors combined by weighted
/// stacking against a threshold from the artifact.
pub struct Ensemble {
    snapshot: RwLock<Arc<EnsembleSnapshot>>,
}

impl Ensemble {
    pub fn new(artifact: EnsembleArtifact) -> Result<Self, ArtifactError> {
        artifact.validate()?;
        let snapshot = Arc::new(EnsembleSnapshot::build(artifact));
        info!(version = %snapshot.artifact_version, "detection ensemble loaded");
        Ok(Self {
            snapshot: RwLock::new(snapshot),
        })
    }

    pub fn with_default_artifact() -> Self {
        let snapshot = Arc::new(EnsembleSnapshot::build(EnsembleArtifact::default()));
        Self {
            snapshot: RwLock::new(snapshot),
        }
    }

    pub fn artifact_version(&self) -> String {
        self.current().artifact_version.clone()
    }

    /// Validate and swap in a new artifact. A failed validation leaves the
    /// running snapshot untouched.
    pub fn reload(&self, artifact: EnsembleArtifact) -> Result<(), ArtifactError> {
        artifact.validate()?;
        let next = Arc::new(EnsembleSnapshot::build(artifact));
        info!(version = %next.artifact_version, "detection artifact reloaded");
        *self.snapshot.write().expect("ensemble snapshot lock") = next;
        Ok(())
    }

    fn current(&self) -> Arc<EnsembleSnapshot> {
        Arc::clone(&self.snapshot.read().expect("ensemble snapshot lock"))
    }

    /// Score one feature frame through every detector and combine.
    ///
    /// Failed detectors have their weight redistributed proportionally over
    /// the survivors; if every detector fails the detection is emitted as
    /// `Unknown` with a NaN score for downstream to treat as monitor-only.
    pub fn score(
        &self,
        frame: &FeatureFrame,
        now_unix_ms: i64,
        counters: &mut EnsembleCounters,
    ) -> Detection {
        let snapshot = self.current();
        let mut phase = SlotPhase::Idle;

        phase = advance(phase, SlotPhase::Scoring);
        let mut verdicts: Vec<DetectorVerdict> = Vec::with_capacity(snapshot.detectors.len());
        let mut live_weights: Vec<f64> = Vec::with_capacity(snapshot.detectors.len());
        let mut any_failed = false;

        for (index, detector) in snapshot.detectors.iter().enumerate() {
            match detector.predict(&frame.vector) {
                Ok(verdict) => {
                    verdicts.push(verdict);
                    live_weights.push(snapshot.weights[index]);
                }
                Err(err) => {
                    any_failed = true;
                    if let Some(slot) = counters.detector_failures.get_mut(index) {
                        *slot = slot.saturating_add(1);
                    }
                    warn!(
                        detector = detector.id().as_str(),
                        vector_id = %frame.context.vector_id,
                        error = %err,
                        "detector failed; redistributing weight"
                    );
                }
            }
        }

        phase = if any_failed && !verdicts.is_empty() {
            counters.degraded = counters.degraded.saturating_add(1);
            advance(phase, SlotPhase::Degraded)
        } else {
            advance(phase, SlotPhase::Combining)
        };

        let (aggregate_score, aggregate_label) = if verdicts.is_empty() {
            counters.unknown_emitted = counters.unknown_emitted.saturating_add(1);
            (f64::NAN, VerdictLabel::Unknown)
        } else {
            let weight_sum: f64 = live_weights.iter().sum();
            let score = if weight_sum > 0.0 {
                verdicts
                    .iter()
                    .zip(live_weights.iter())
                    .map(|(verdict, weight)| verdict.score * weight / weight_sum)
                    .sum::<f64>()
                    .clamp(0.0, 1.0)
            } else {
                0.0
            };
            let label = if score >= snapshot.threshold {
                VerdictLabel::Threat
            } else {
                VerdictLabel::Benign
            };
            (score, label)
        };

        let _ = advance(phase, SlotPhase::Emitted);
        counters.scored = counters.scored.saturating_add(1);

        Detection {
            detection_id: new_detection_id(),
            context: frame.context.clone(),
            features: frame.vector.clone(),
            verdicts,
            aggregate_score,
            aggregate_label,
            decided_at_unix_ms: now_unix_ms,
        }
    }
}

/// Legal slot transitions; anything else is a programming error caught in
/// debug builds.
fn advance(from: SlotPhase, to: SlotPhase) -> SlotPhase {
    debug_assert!(
        matches!(
            (from, to),
            (SlotPhase::Idle, SlotPhase::Scoring)
                | (SlotPhase::Scoring, SlotPhase::Combining)
                | (SlotPhase::Scoring, SlotPhase::Degraded)
                | (SlotPhase::Combining, SlotPhase::Emitted)
                | (SlotPhase::Degraded, SlotPhase::Emitted)
        ),
        "illegal slot transition {:?} -> {:?}",
        from,
        to
    );
    to
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DetectorError;
    use crate::types::DetectorId;
    use features::layout::slot;
    use features::{FeatureContext, FeatureVector, WindowKind};
    use ingest::Protocol;

    fn frame(vector: FeatureVector) -> FeatureFrame {
        FeatureFrame {
            vector,
            context: FeatureContext {
                vector_id: "fv_test".to_string(),
                window_key: "203.0.113.7".to_string(),
                window_kind: WindowKind::Tumbling,
                window_start_unix_ms: 0,
                window_end_unix_ms: 30_000,
                record_count: 200,
                key_addr: "203.0.113.7".parse().expect("addr"),
                key_dst_port: None,
                top_dst_port: 80,
                protocol: Protocol::Tcp,
            },
        }
    }

    fn syn_flood_vector() -> FeatureVector {
        let mut v = FeatureVector::zeroed();
        v.slots[slot::SYN_RATIO] = 0.97;
        v.slots[slot::RECORD_COUNT] = 0.2;
        v.slots[slot::PACKET_RATE] = 0.06;
        v.slots[slot::DST_PORT_ENTROPY] = 0.0;
        v.slots[slot::WELL_KNOWN_PORT_RATIO] = 1.0;
        v
    }

    fn benign_vector() -> FeatureVector {
        let artifact = EnsembleArtifact::default();
        let mut v = FeatureVector::zeroed();
        for (index, median) in artifact.isolation.medians.iter().enumerate() {
            v.slots[index] = *median;
        }
        v
    }

    #[test]
    fn threat_label_iff_score_crosses_threshold() {
        let ensemble = Ensemble::with_default_artifact();
        let mut counters = EnsembleCounters::default();

        let hot = ensemble.score(&frame(syn_flood_vector()), 1, &mut counters);
        assert_eq!(hot.aggregate_label, VerdictLabel::Threat);
        assert!(hot.aggregate_score >= 0.60, "score {}", hot.aggregate_score);
        assert_eq!(hot.verdicts.len(), 4);

        let calm = ensemble.score(&frame(benign_vector()), 2, &mut counters);
        assert_eq!(calm.aggregate_label, VerdictLabel::Benign);
        assert!(calm.aggregate_score < 0.60);
        assert_eq!(counters.scored, 2);
    }

    #[test]
    fn aggregate_score_stays_in_range() {
        let ensemble = Ensemble::with_default_artifact();
        let mut counters = EnsembleCounters::default();
        for step in 0..8 {
            let mut v = FeatureVector::zeroed();
            for s in v.slots.iter_mut() {
                *s = step as f64 / 7.0;
            }
            let detection = ensemble.score(&frame(v), step, &mut counters);
            assert!((0.0..=1.0).contains(&detection.aggregate_score));
        }
    }

    struct FailingDetector;

    impl Detector for FailingDetector {
        fn id(&self) -> DetectorId {
            DetectorId::Sequence
        }

        fn predict(&self, _: &FeatureVector) -> Result<DetectorVerdict, DetectorError> {
            Err(DetectorError::Internal {
                detector: DetectorId::Sequence,
                message: "forced".to_string(),
            })
        }
    }

    #[test]
    fn partial_failure_redistributes_weight() {
        let ensemble = Ensemble::with_default_artifact();
        {
            let mut snapshot = ensemble.snapshot.write().expect("lock");
            let artifact = EnsembleArtifact::default();
            let mut rebuilt = EnsembleSnapshot::build(artifact);
            rebuilt.detectors[1] = Box::new(FailingDetector);
            *snapshot = Arc::new(rebuilt);
        }

        let mut counters = EnsembleCounters::default();
        let detection = ensemble.score(&frame(syn_flood_vector()), 1, &mut counters);
        assert_eq!(detection.verdicts.len(), 3);
        assert_eq!(counters.detector_failures[1], 1);
        assert_eq!(counters.degraded, 1);
        // Still a decisive threat with the surviving detectors.
        assert_eq!(detection.aggregate_label, VerdictLabel::Threat);
        assert!(detection.aggregate_score.is_finite());
    }

    #[test]
    fn all_detectors_down_yields_unknown_nan() {
        let ensemble = Ensemble::with_default_artifact();
        {
            let mut snapshot = ensemble.snapshot.write().expect("lock");
            let artifact = EnsembleArtifact::default();
            let mut rebuilt = EnsembleSnapshot::build(artifact);
            for slot in rebuilt.detectors.iter_mut() {
                *slot = Box::new(FailingDetector);
            }
            *snapshot = Arc::new(rebuilt);
        }

        let mut counters = EnsembleCounters::default();
        let detection = ensemble.score(&frame(benign_vector()), 1, &mut counters);
        assert!(detection.aggregate_score.is_nan());
        assert_eq!(detection.aggregate_label, VerdictLabel::Unknown);
        assert!(detection.verdicts.is_empty());
        assert_eq!(counters.unknown_emitted, 1);
    }

    #[test]
    fn reload_swaps_threshold() {
        let ensemble = Ensemble::with_default_artifact();
        let mut artifact = EnsembleArtifact::default();
        artifact.threshold = 0.95;
        artifact.artifact_version = "2.4.0".to_string();
        ensemble.reload(artifact).expect("reload");

        assert_eq!(ensemble.artifact_version(), "2.4.0");
        let mut counters = EnsembleCounters::default();
        let detection = ensemble.score(&frame(syn_flood_vector()), 1, &mut counters);
        // Same traffic, stricter threshold: no longer labeled threat.
        assert_eq!(detection.aggregate_label, VerdictLabel::Benign);
    }

    #[test]
    fn bad_reload_keeps_running_snapshot() {
        let ensemble = Ensemble::with_default_artifact();
        let before = ensemble.artifact_version();
        let mut artifact = EnsembleArtifact::default();
        artifact.weights.gradient_stumps = 2.0;
        assert!(ensemble.reload(artifact).is_err());
        assert_eq!(ensemble.artifact_version(), before);
    }
}
