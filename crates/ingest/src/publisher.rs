use std::time::Duration;

use bus::{partition_for, PublishError, Topic};
use tokio::time;
use tracing::{debug, warn};

use crate::counters::{IngestCounters, RateGauge};
use crate::dedup::{DedupKey, DedupVerdict, Deduper};
use crate::normalize::Normalizer;
use crate::parsers::parse_frame;
use crate::record::{CommonRecord, Framing};

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub dedup_capacity: usize,
    pub publish_retry_max: u32,
    pub publish_retry_base_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            dedup_capacity: 65_536,
            publish_retry_max: 3,
            publish_retry_base_ms: 50,
        }
    }
}

/// One ingest worker: parse → normalize → dedup → publish. Owns its dedup
/// window and counters; a full bus partition blocks this worker (and through
/// it, the collector socket) rather than growing memory.
pub struct IngestStage {
    config: IngestConfig,
    normalizer: Normalizer,
    deduper: Deduper,
    counters: IngestCounters,
    rate: RateGauge,
}

impl IngestStage {
    pub fn new(config: IngestConfig) -> Self {
        let deduper = Deduper::new(config.dedup_capacity);
        Self {
            config,
            normalizer: Normalizer::new(),
            deduper,
            counters: IngestCounters::default(),
            rate: RateGauge::default(),
        }
    }

    /// Ingest one collector frame. Returns how many records reached the bus.
    pub async fn ingest_frame(
        &mut self,
        framing: Framing,
        data: &[u8],
        sensor_id: &str,
        topic: &Topic<CommonRecord>,
        now_ms: i64,
    ) -> usize {
        self.counters.frames = self.counters.frames.saturating_add(1);

        let raw_flows = match parse_frame(framing, data, sensor_id) {
            Ok(flows) => flows,
            Err(err) => {
                debug!(framing = framing.as_str(), error = %err, "dropping malformed frame");
                self.counters.count_malformed(err.reason());
                return 0;
            }
        };

        let mut published = 0usize;
        for raw in raw_flows {
            let record = match self.normalizer.normalize(raw) {
                Ok(record) => record,
                Err(err) => {
                    self.counters.count_malformed(err.reason());
                    continue;
                }
            };
            self.counters.parsed = self.counters.parsed.saturating_add(1);
            self.count_framing(record.origin.framing);

            let verdict = self.deduper.observe(DedupKey {
                sensor_id: record.origin.sensor_id.clone(),
                flow_id: record.origin.flow_id,
                t_end_unix_ms: record.t_end_unix_ms,
            });
            match verdict {
                DedupVerdict::Duplicate => {
                    self.counters.duplicates = self.counters.duplicates.saturating_add(1);
                    continue;
                }
                DedupVerdict::FreshEvicting => {
                    self.counters.dedup_evicted = self.counters.dedup_evicted.saturating_add(1);
                }
                DedupVerdict::Fresh => {}
            }

            if self.publish_with_retry(record, topic).await {
                published += 1;
            }
        }

        self.rate.observe(now_ms, published as u64);
        published
    }

    /// Bounded retry on a full partition, then drop. Loss is preferred over
    /// unbounded buffering here; the drop is counted.
    async fn publish_with_retry(
        &mut self,
        record: CommonRecord,
        topic: &Topic<CommonRecord>,
    ) -> bool {
        let partition = partition_for(&record.partition_key(), topic.partition_count());

        let mut pending = record;
        let mut attempt = 0u32;
        loop {
            match topic.publish(partition, pending.clone()).await {
                Ok(_) => {
                    self.counters.published = self.counters.published.saturating_add(1);
                    return true;
                }
                Err(PublishError::Timeout { .. }) if attempt < self.config.publish_retry_max => {
                    attempt += 1;
                    self.counters.publish_retries =
                        self.counters.publish_retries.saturating_add(1);
                    let delay = self
                        .config
                        .publish_retry_base_ms
                        .saturating_mul(1u64 << attempt.min(6));
                    time::sleep(Duration::from_millis(delay)).await;
                }
                Err(err) => {
                    warn!(error = %err, record_id = %pending.record_id, "dropping record after publish retries");
                    self.counters.publish_dropped =
                        self.counters.publish_dropped.saturating_add(1);
                    return false;
                }
            }
        }
    }

    fn count_framing(&mut self, framing: Framing) {
        let slot = match framing {
            Framing::PacketSummary => &mut self.counters.packet_summary_records,
            Framing::FlowV5 => &mut self.counters.flow_v5_records,
            Framing::FlowJson => &mut self.counters.flow_json_records,
            Framing::HostEvent => &mut self.counters.host_event_records,
        };
        *slot = slot.saturating_add(1);
    }

    pub fn counters(&self) -> &IngestCounters {
        &self.counters
    }

    pub fn records_per_sec(&self) -> f64 {
        self.rate.records_per_sec()
    }
}
