//! Explanation and audit trail: one immutable record per decision holding
//! the feature vector, every detector verdict, the chosen action, the
//! synthesized rule, and per-adapter outcomes. The store is the sole
//! source of truth for post-hoc explanation queries.

mod record;
mod store;

pub use record::{AuditRecord, StageTimestamps};
pub use store::{AuditStore, MemoryAuditStore, SqliteAuditStore, DEFAULT_MEMORY_CAP};

#[cfg(test)]
mod tests {
    use super::*;
    use detection::{Ensemble, EnsembleCounters};
    use features::{FeatureContext, FeatureFrame, FeatureVector, WindowKind};
    use ingest::Protocol;
    use policy_agent::{AgentCounters, DecisionContext, PolicyAgent};

    fn sample_record(created_at_unix: i64) -> AuditRecord {
        let frame = FeatureFrame {
            vector: FeatureVector::zeroed(),
            context: FeatureContext {
                vector_id: "fv_a".to_string(),
                window_key: "203.0.113.7".to_string(),
                window_kind: WindowKind::Tumbling,
                window_start_unix_ms: 0,
                window_end_unix_ms: 30_000,
                record_count: 5,
                key_addr: "203.0.113.7".parse().expect("addr"),
                key_dst_port: None,
                top_dst_port: 80,
                protocol: Protocol::Tcp,
            },
        };
        let detection = Ensemble::with_default_artifact().score(
            &frame,
            1_700_000_000_000,
            &mut EnsembleCounters::default(),
        );
        let decision = PolicyAgent::with_default_artifact().decide(
            &detection,
            &DecisionContext::default(),
            &mut AgentCounters::default(),
        );
        AuditRecord::new(detection, decision, created_at_unix)
    }

    #[test]
    fn memory_store_round_trips_by_detection_and_rule() {
        let mut store = AuditStore::memory(16);
        let record = sample_record(100);
        let detection_id = record.detection_id.clone();
        store.append(record).expect("append");

        let found = store.by_detection(&detection_id).expect("query");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].detection_id, detection_id);
        assert!(store.by_rule("rule_none").expect("query").is_empty());
    }

    #[test]
    fn memory_store_enforces_cap() {
        let mut store = AuditStore::memory(4);
        for i in 0..10 {
            store.append(sample_record(i)).expect("append");
        }
        assert_eq!(store.count().expect("count"), 4);
    }

    #[test]
    fn purge_respects_cutoff_and_batch() {
        let mut store = AuditStore::memory(100);
        for i in 0..10 {
            store.append(sample_record(i)).expect("append");
        }
        assert_eq!(store.purge_older_than(5, 3).expect("purge"), 3);
        assert_eq!(store.purge_older_than(5, 10).expect("purge"), 2);
        assert_eq!(store.count().expect("count"), 5);
    }

    #[test]
    fn sqlite_store_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.db");
        let mut store = AuditStore::sqlite(&path.to_string_lossy()).expect("open");

        let record = sample_record(100);
        let detection_id = record.detection_id.clone();
        let decision_action = record.decision.action;
        store.append(record).expect("append");

        let found = store.by_detection(&detection_id).expect("query");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].decision.action, decision_action);
        assert_eq!(found[0].detection.verdicts.len(), 4);
        assert_eq!(store.count().expect("count"), 1);
    }

    #[test]
    fn sqlite_purge_deletes_in_batches() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.db");
        let mut store = AuditStore::sqlite(&path.to_string_lossy()).expect("open");

        for i in 0..10 {
            store.append(sample_record(i)).expect("append");
        }
        assert_eq!(store.purge_older_than(8, 5).expect("purge"), 5);
        assert_eq!(store.purge_older_than(8, 5).expect("purge"), 3);
        assert_eq!(store.count().expect("count"), 2);
    }
}
