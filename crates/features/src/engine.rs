use std::collections::HashMap;

use ingest::CommonRecord;
use tracing::debug;

use crate::aggregates::WindowAggregates;
use crate::vector::{key_display, new_vector_id, FeatureContext, FeatureFrame};
use crate::window::{KeyProjection, WindowKey, WindowKind, WindowSpec};

#[derive(Debug, Clone)]
pub struct FeatureConfig {
    pub projections: Vec<KeyProjection>,
    pub windows: Vec<WindowSpec>,
    pub allowed_lateness_ms: i64,
    /// Eviction threshold on tracked keys; the coldest key is dropped first.
    pub max_tracked_keys: usize,
    pub port_cardinality_cap: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            projections: vec![KeyProjection::SrcAddr, KeyProjection::SrcAddrDstPort],
            windows: vec![
                WindowSpec::tumbling(30_000),
                WindowSpec::sliding(60_000, 15_000),
                WindowSpec::session(120_000),
            ],
            allowed_lateness_ms: 5_000,
            max_tracked_keys: 16_384,
            port_cardinality_cap: 512,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FeatureCounters {
    pub records: u64,
    pub late_dropped: u64,
    pub windows_opened: u64,
    pub vectors_emitted: u64,
    pub windows_evicted: u64,
    pub keys_evicted: u64,
}

struct OpenWindow {
    spec_index: usize,
    kind: WindowKind,
    start_ms: i64,
    end_ms: i64,
    /// Wall-clock of the last record folded in; session gap checks only.
    last_activity_wall_ms: i64,
    aggregates: WindowAggregates,
}

struct KeyState {
    windows: Vec<OpenWindow>,
    last_touch_tick: u64,
}

/// One shard of the feature engine. A shard is single-writer: exactly one
/// worker task owns it, so window mutation needs no locking. Record time
/// (`t_end`) drives window assignment and closure; wall-clock is consulted
/// only for session gaps.
pub struct FeatureEngine {
    config: FeatureConfig,
    keys: HashMap<WindowKey, KeyState>,
    watermark_ms: i64,
    tick: u64,
    counters: FeatureCounters,
}

impl FeatureEngine {
    pub fn new(config: FeatureConfig) -> Self {
        Self {
            config,
            keys: HashMap::new(),
            watermark_ms: i64::MIN,
            tick: 0,
            counters: FeatureCounters::default(),
        }
    }

    pub fn counters(&self) -> &FeatureCounters {
        &self.counters
    }

    pub fn tracked_keys(&self) -> usize {
        self.keys.len()
    }

    /// Fold one record into every window it belongs to, then close whatever
    /// the advanced watermark makes closable on the touched keys.
    pub fn observe(&mut self, record: &CommonRecord, now_wall_ms: i64) -> Vec<FeatureFrame> {
        self.tick += 1;
        self.counters.records = self.counters.records.saturating_add(1);

        let t = record.t_end_unix_ms;
        if self.watermark_ms != i64::MIN
            && t < self.watermark_ms.saturating_sub(self.config.allowed_lateness_ms)
        {
            self.counters.late_dropped = self.counters.late_dropped.saturating_add(1);
            debug!(
                record_id = %record.record_id,
                t_end = t,
                watermark = self.watermark_ms,
                "dropping late record"
            );
            return Vec::new();
        }
        self.watermark_ms = self.watermark_ms.max(t);

        let mut touched = Vec::with_capacity(self.config.projections.len());
        for index in 0..self.config.projections.len() {
            let key = self.config.projections[index].project(record);
            self.fold_into_key(key, record, now_wall_ms);
            touched.push(key);
        }

        let mut emitted = Vec::new();
        for key in touched {
            emitted.extend(self.close_due_for_key(key, now_wall_ms));
        }
        emitted
    }

    /// Periodic sweep: closes due windows on keys that stopped receiving
    /// records (idle sessions in particular) and drops empty key slots.
    pub fn sweep(&mut self, now_wall_ms: i64) -> Vec<FeatureFrame> {
        let keys: Vec<WindowKey> = self.keys.keys().copied().collect();
        let mut emitted = Vec::new();
        for key in keys {
            emitted.extend(self.close_due_for_key(key, now_wall_ms));
        }
        self.keys.retain(|_, state| !state.windows.is_empty());
        emitted
    }

    fn fold_into_key(&mut self, key: WindowKey, record: &CommonRecord, now_wall_ms: i64) {
        self.evict_if_needed(&key);

        let tick = self.tick;
        let port_cap = self.config.port_cardinality_cap;
        let specs = &self.config.windows;
        let counters = &mut self.counters;
        let state = self.keys.entry(key).or_insert_with(|| KeyState {
            windows: Vec::new(),
            last_touch_tick: tick,
        });
        state.last_touch_tick = tick;

        let t = record.t_end_unix_ms;
        for (spec_index, spec) in specs.iter().enumerate() {
            match spec.kind {
                WindowKind::Tumbling => {
                    let start = spec.tumbling_start(t);
                    let window = ensure_window(
                        &mut state.windows,
                        spec_index,
                        WindowKind::Tumbling,
                        start,
                        start + spec.span_ms.max(1),
                        port_cap,
                        counters,
                    );
                    window.aggregates.observe(record);
                    window.last_activity_wall_ms = now_wall_ms;
                }
                WindowKind::Sliding => {
                    for start in spec.sliding_starts(t) {
                        let window = ensure_window(
                            &mut state.windows,
                            spec_index,
                            WindowKind::Sliding,
                            start,
                            start + spec.span_ms.max(1),
                            port_cap,
                            counters,
                        );
                        window.aggregates.observe(record);
                        window.last_activity_wall_ms = now_wall_ms;
                    }
                }
                WindowKind::Session => {
                    let gap = spec.gap();
                    let existing = state
                        .windows
                        .iter_mut()
                        .find(|w| w.spec_index == spec_index);
                    match existing {
                        Some(window) => {
                            window.end_ms = t + gap;
                            window.aggregates.observe(record);
                            window.last_activity_wall_ms = now_wall_ms;
                        }
                        None => {
                            counters.windows_opened = counters.windows_opened.saturating_add(1);
                            let mut window = OpenWindow {
                                spec_index,
                                kind: WindowKind::Session,
                                start_ms: t,
                                end_ms: t + gap,
                                last_activity_wall_ms: now_wall_ms,
                                aggregates: WindowAggregates::new(port_cap),
                            };
                            window.aggregates.observe(record);
                            state.windows.push(window);
                        }
                    }
                }
            }
        }
    }

    fn close_due_for_key(&mut self, key: WindowKey, now_wall_ms: i64) -> Vec<FeatureFrame> {
        let watermark = self.watermark_ms;
        let lateness = self.config.allowed_lateness_ms;
        let specs = &self.config.windows;

        let Some(state) = self.keys.get_mut(&key) else {
            return Vec::new();
        };

        let mut due: Vec<OpenWindow> = Vec::new();
        let mut remaining: Vec<OpenWindow> = Vec::new();
        for window in state.windows.drain(..) {
            let closable = match window.kind {
                // Keep the window open through the lateness horizon so
                // allowed stragglers still land in it.
                WindowKind::Tumbling | WindowKind::Sliding => {
                    watermark != i64::MIN && watermark >= window.end_ms.saturating_add(lateness)
                }
                WindowKind::Session => {
                    let gap = specs
                        .get(window.spec_index)
                        .map(|s| s.gap())
                        .unwrap_or(30_000);
                    now_wall_ms.saturating_sub(window.last_activity_wall_ms) >= gap
                }
            };
            if closable {
                due.push(window);
            } else {
                remaining.push(window);
            }
        }
        state.windows = remaining;

        // Tie-break simultaneous closes: kind order, then start time.
        due.sort_by_key(|w| (w.kind, w.start_ms));

        due.into_iter()
            .map(|window| {
                self.counters.vectors_emitted = self.counters.vectors_emitted.saturating_add(1);
                materialize(key, window)
            })
            .collect()
    }

    fn evict_if_needed(&mut self, incoming: &WindowKey) {
        if self.keys.contains_key(incoming) || self.keys.len() < self.config.max_tracked_keys {
            return;
        }
        let coldest = self
            .keys
            .iter()
            .min_by_key(|(_, state)| state.last_touch_tick)
            .map(|(key, _)| *key);
        if let Some(key) = coldest {
            if let Some(state) = self.keys.remove(&key) {
                self.counters.keys_evicted = self.counters.keys_evicted.saturating_add(1);
                self.counters.windows_evicted = self
                    .counters
                    .windows_evicted
                    .saturating_add(state.windows.len() as u64);
                debug!(key = %key_display(&key), dropped_windows = state.windows.len(), "evicted coldest window key");
            }
        }
    }
}

fn ensure_window<'a>(
    windows: &'a mut Vec<OpenWindow>,
    spec_index: usize,
    kind: WindowKind,
    start_ms: i64,
    end_ms: i64,
    port_cap: usize,
    counters: &mut FeatureCounters,
) -> &'a mut OpenWindow {
    let position = windows
        .iter()
        .position(|w| w.spec_index == spec_index && w.start_ms == start_ms);
    match position {
        Some(index) => &mut windows[index],
        None => {
            counters.windows_opened = counters.windows_opened.saturating_add(1);
            windows.push(OpenWindow {
                spec_index,
                kind,
                start_ms,
                end_ms,
                last_activity_wall_ms: 0,
                aggregates: WindowAggregates::new(port_cap),
            });
            windows.last_mut().expect("just pushed")
        }
    }
}

fn materialize(key: WindowKey, window: OpenWindow) -> FeatureFrame {
    let span = window.end_ms.saturating_sub(window.start_ms).max(1);
    let vector = window.aggregates.finalize(span);
    FeatureFrame {
        vector,
        context: FeatureContext {
            vector_id: new_vector_id(),
            window_key: key_display(&key),
            window_kind: window.kind,
            window_start_unix_ms: window.start_ms,
            window_end_unix_ms: window.end_ms,
            record_count: window.aggregates.record_count(),
            key_addr: key.src_addr(),
            key_dst_port: key.dst_port(),
            top_dst_port: window.aggregates.top_dst_port(),
            protocol: window.aggregates.dominant_protocol(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::slot;
    use ingest::{FiveTuple, Framing, Protocol, RecordOrigin, TcpFlagCounts};

    fn record(t_end: i64, src: &str, dst_port: u16) -> CommonRecord {
        CommonRecord {
            record_id: format!("rec_{}", t_end),
            t_start_unix_ms: t_end - 50,
            t_end_unix_ms: t_end,
            tuple: FiveTuple {
                src_addr: src.parse().expect("addr"),
                src_port: 50_000,
                dst_addr: "10.0.0.5".parse().expect("addr"),
                dst_port,
                protocol: Protocol::Tcp,
            },
            fwd_bytes: 120,
            bwd_bytes: 0,
            fwd_packets: 2,
            bwd_packets: 0,
            flags: TcpFlagCounts::default(),
            origin: RecordOrigin {
                framing: Framing::FlowJson,
                sensor_id: "s1".to_string(),
                flow_id: t_end as u64,
            },
        }
    }

    fn tumbling_only(span: i64, lateness: i64) -> FeatureConfig {
        FeatureConfig {
            projections: vec![KeyProjection::SrcAddr],
            windows: vec![WindowSpec::tumbling(span)],
            allowed_lateness_ms: lateness,
            max_tracked_keys: 64,
            port_cardinality_cap: 64,
        }
    }

    const T0: i64 = 1_700_000_000_000;

    #[test]
    fn tumbling_window_closes_past_lateness_horizon() {
        let mut engine = FeatureEngine::new(tumbling_only(10_000, 1_000));

        assert!(engine.observe(&record(T0 + 1_000, "203.0.113.7", 80), 0).is_empty());
        assert!(engine.observe(&record(T0 + 9_000, "203.0.113.7", 80), 0).is_empty());
        // Watermark reaches end + lateness: the first window closes.
        let frames = engine.observe(&record(T0 + 11_500, "203.0.113.7", 80), 0);
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame.context.record_count, 2);
        assert_eq!(frame.context.window_start_unix_ms, T0);
        assert_eq!(frame.context.window_end_unix_ms, T0 + 10_000);
        assert!(frame.vector.is_well_formed());
    }

    #[test]
    fn boundary_record_lands_in_next_window() {
        let mut engine = FeatureEngine::new(tumbling_only(10_000, 0));

        let mut frames = Vec::new();
        frames.extend(engine.observe(&record(T0 + 9_999, "203.0.113.7", 80), 0));
        frames.extend(engine.observe(&record(T0 + 10_000, "203.0.113.7", 80), 0));
        frames.extend(engine.observe(&record(T0 + 20_000, "203.0.113.7", 80), 0));

        // First window holds only the t=9999 record.
        let first = frames
            .iter()
            .find(|f| f.context.window_start_unix_ms == T0)
            .expect("first window closed");
        assert_eq!(first.context.record_count, 1);
        let second = frames
            .iter()
            .find(|f| f.context.window_start_unix_ms == T0 + 10_000)
            .expect("second window closed");
        assert_eq!(second.context.record_count, 1);
    }

    #[test]
    fn late_record_is_dropped_and_counted() {
        let mut engine = FeatureEngine::new(tumbling_only(10_000, 1_000));

        engine.observe(&record(T0 + 20_000, "203.0.113.7", 80), 0);
        let frames = engine.observe(&record(T0 + 10_000, "203.0.113.7", 80), 0);
        assert!(frames.is_empty());
        assert_eq!(engine.counters().late_dropped, 1);
    }

    #[test]
    fn allowed_straggler_still_lands() {
        let mut engine = FeatureEngine::new(tumbling_only(10_000, 5_000));

        engine.observe(&record(T0 + 9_000, "203.0.113.7", 80), 0);
        engine.observe(&record(T0 + 12_000, "203.0.113.7", 80), 0);
        // 8s is within the 5s lateness of the 12s watermark.
        engine.observe(&record(T0 + 8_000, "203.0.113.7", 80), 0);
        let frames = engine.observe(&record(T0 + 16_000, "203.0.113.7", 80), 0);
        let first = frames
            .iter()
            .find(|f| f.context.window_start_unix_ms == T0)
            .expect("first window closed");
        assert_eq!(first.context.record_count, 2);
    }

    #[test]
    fn session_closes_on_wall_clock_gap() {
        let config = FeatureConfig {
            projections: vec![KeyProjection::SrcAddr],
            windows: vec![WindowSpec::session(2_000)],
            allowed_lateness_ms: 0,
            max_tracked_keys: 64,
            port_cardinality_cap: 64,
        };
        let mut engine = FeatureEngine::new(config);

        engine.observe(&record(T0, "198.51.100.12", 22), 10_000);
        engine.observe(&record(T0 + 500, "198.51.100.12", 22), 10_400);
        assert!(engine.sweep(11_000).is_empty());
        let frames = engine.sweep(12_500);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].context.record_count, 2);
        assert_eq!(frames[0].context.window_kind, WindowKind::Session);
    }

    #[test]
    fn sliding_windows_overlap() {
        let config = FeatureConfig {
            projections: vec![KeyProjection::SrcAddr],
            windows: vec![WindowSpec::sliding(20_000, 10_000)],
            allowed_lateness_ms: 0,
            max_tracked_keys: 64,
            port_cardinality_cap: 64,
        };
        let mut engine = FeatureEngine::new(config);

        engine.observe(&record(T0 + 15_000, "203.0.113.7", 80), 0);
        let frames = engine.observe(&record(T0 + 45_000, "203.0.113.7", 80), 0);
        // The record at 15s sat in windows [0,20) and [10,30): both closed.
        let counts: Vec<u64> = frames.iter().map(|f| f.context.record_count).collect();
        assert_eq!(frames.len(), 2);
        assert!(counts.iter().all(|&c| c == 1));
        // Ordered by start time.
        assert!(frames[0].context.window_start_unix_ms < frames[1].context.window_start_unix_ms);
    }

    #[test]
    fn cold_keys_are_evicted_at_cap() {
        let mut config = tumbling_only(10_000, 0);
        config.max_tracked_keys = 2;
        let mut engine = FeatureEngine::new(config);

        engine.observe(&record(T0, "10.0.0.1", 80), 0);
        engine.observe(&record(T0 + 1, "10.0.0.2", 80), 0);
        engine.observe(&record(T0 + 2, "10.0.0.3", 80), 0);
        assert_eq!(engine.tracked_keys(), 2);
        assert_eq!(engine.counters().keys_evicted, 1);
        assert_eq!(engine.counters().windows_evicted, 1);
    }

    #[test]
    fn projections_produce_parallel_keys() {
        let config = FeatureConfig {
            projections: vec![KeyProjection::SrcAddr, KeyProjection::SrcAddrDstPort],
            windows: vec![WindowSpec::tumbling(10_000)],
            allowed_lateness_ms: 0,
            max_tracked_keys: 64,
            port_cardinality_cap: 64,
        };
        let mut engine = FeatureEngine::new(config);

        engine.observe(&record(T0, "203.0.113.7", 80), 0);
        assert_eq!(engine.tracked_keys(), 2);
        let frames = engine.observe(&record(T0 + 20_000, "203.0.113.7", 80), 0);
        assert_eq!(frames.len(), 2);
        let keyed: Vec<&str> = frames
            .iter()
            .map(|f| f.context.window_key.as_str())
            .collect();
        assert!(keyed.contains(&"203.0.113.7"));
        assert!(keyed.contains(&"203.0.113.7:80"));
    }

    #[test]
    fn syn_burst_vector_reflects_flag_ratios() {
        let mut engine = FeatureEngine::new(tumbling_only(30_000, 0));
        for i in 0..200 {
            let mut rec = record(T0 + i * 140, "203.0.113.7", 80);
            rec.flags.syn = 2;
            rec.fwd_packets = 2;
            engine.observe(&rec, 0);
        }
        let frames = engine.observe(&record(T0 + 61_000, "203.0.113.7", 80), 0);
        let burst = frames
            .iter()
            .find(|f| f.context.window_start_unix_ms == T0.div_euclid(30_000) * 30_000)
            .expect("burst window");
        assert!(burst.vector.get(slot::SYN_RATIO) > 0.8);
        assert!(burst.vector.get(slot::RECORD_COUNT) > 0.05);
    }
}
