/// Drop/flow accounting for the ingest stage. Every loss path increments
/// exactly one counter; the hot loop never propagates parse failures upward.
#[derive(Debug, Clone, Default)]
pub struct IngestCounters {
    pub frames: u64,
    pub parsed: u64,
    pub published: u64,

    pub malformed_truncated: u64,
    pub malformed_bad_json: u64,
    pub malformed_missing_field: u64,
    pub malformed_bad_address: u64,
    pub malformed_bad_time_range: u64,
    pub malformed_unsupported_version: u64,

    pub duplicates: u64,
    pub dedup_evicted: u64,

    pub publish_retries: u64,
    pub publish_dropped: u64,

    pub packet_summary_records: u64,
    pub flow_v5_records: u64,
    pub flow_json_records: u64,
    pub host_event_records: u64,
}

impl IngestCounters {
    pub fn count_malformed(&mut self, reason: &str) {
        let slot = match reason {
            "truncated" => &mut self.malformed_truncated,
            "bad_json" => &mut self.malformed_bad_json,
            "missing_field" => &mut self.malformed_missing_field,
            "bad_address" => &mut self.malformed_bad_address,
            "bad_time_range" => &mut self.malformed_bad_time_range,
            _ => &mut self.malformed_unsupported_version,
        };
        *slot = slot.saturating_add(1);
    }

    pub fn malformed_total(&self) -> u64 {
        self.malformed_truncated
            + self.malformed_bad_json
            + self.malformed_missing_field
            + self.malformed_bad_address
            + self.malformed_bad_time_range
            + self.malformed_unsupported_version
    }
}

/// Rolling records-per-second gauge, one-second buckets.
#[derive(Debug, Clone, Default)]
pub struct RateGauge {
    bucket_start_ms: i64,
    bucket_count: u64,
    last_rate: f64,
}

impl RateGauge {
    pub fn observe(&mut self, now_ms: i64, count: u64) {
        if now_ms.saturating_sub(self.bucket_start_ms) >= 1_000 {
            let elapsed_s = (now_ms - self.bucket_start_ms).max(1) as f64 / 1_000.0;
            self.last_rate = self.bucket_count as f64 / elapsed_s;
            self.bucket_start_ms = now_ms;
            self.bucket_count = 0;
        }
        self.bucket_count = self.bucket_count.saturating_add(count);
    }

    pub fn records_per_sec(&self) -> f64 {
        self.last_rate
    }
}
