use std::collections::HashMap;

use ingest::{CommonRecord, Protocol};

use crate::layout::{self, slot, FEATURE_SLOT_COUNT};
use crate::vector::FeatureVector;

/// Streaming mean/variance (Welford). Constant work per observation.
#[derive(Debug, Clone, Default)]
pub struct Moments {
    n: u64,
    mean: f64,
    m2: f64,
}

impl Moments {
    pub fn observe(&mut self, value: f64) {
        self.n += 1;
        let delta = value - self.mean;
        self.mean += delta / self.n as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.n
    }

    pub fn mean(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            self.mean
        }
    }

    pub fn variance(&self) -> f64 {
        if self.n < 2 {
            0.0
        } else {
            self.m2 / (self.n - 1) as f64
        }
    }

    pub fn stddev(&self) -> f64 {
        self.variance().max(0.0).sqrt()
    }
}

/// Bounded categorical counter for entropy estimation. Cardinality above the
/// cap folds into a single overflow bucket so per-record work stays constant.
#[derive(Debug, Clone)]
pub struct CategoricalCounter {
    counts: HashMap<u16, u64>,
    overflow: u64,
    cap: usize,
    total: u64,
}

impl CategoricalCounter {
    pub fn new(cap: usize) -> Self {
        Self {
            counts: HashMap::new(),
            overflow: 0,
            cap: cap.max(1),
            total: 0,
        }
    }

    pub fn observe(&mut self, value: u16) {
        self.total += 1;
        if let Some(entry) = self.counts.get_mut(&value) {
            *entry += 1;
        } else if self.counts.len() < self.cap {
            self.counts.insert(value, 1);
        } else {
            self.overflow += 1;
        }
    }

    pub fn distinct(&self) -> usize {
        self.counts.len() + usize::from(self.overflow > 0)
    }

    pub fn most_frequent(&self) -> Option<u16> {
        self.counts
            .iter()
            .max_by_key(|(value, count)| (**count, u16::MAX - **value))
            .map(|(value, _)| *value)
    }

    /// Shannon entropy normalized by the maximum for the observed support,
    /// in [0, 1]. Zero for empty or single-category windows.
    pub fn normalized_entropy(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let support = self.distinct();
        if support < 2 {
            return 0.0;
        }

        let total = self.total as f64;
        let mut bits = 0.0;
        for count in self.counts.values().copied().chain(
            (self.overflow > 0)
                .then_some(self.overflow)
                .into_iter(),
        ) {
            let p = count as f64 / total;
            if p > 0.0 {
                bits -= p * p.log2();
            }
        }
        (bits / (support as f64).log2()).clamp(0.0, 1.0)
    }
}

/// Incremental per-window aggregate state. Updated once per record,
/// materialized into a `FeatureVector` on close.
#[derive(Debug, Clone)]
pub struct WindowAggregates {
    records: u64,
    fwd_bytes: u64,
    bwd_bytes: u64,
    fwd_packets: u64,
    bwd_packets: u64,
    syn: u64,
    ack: u64,
    fin: u64,
    rst: u64,
    psh: u64,
    urg: u64,
    flow_sizes: Moments,
    durations: Moments,
    inter_arrivals: Moments,
    last_t_end_ms: Option<i64>,
    first_t_end_ms: Option<i64>,
    max_t_end_ms: i64,
    dst_ports: CategoricalCounter,
    protocols: [u64; 4],
    well_known_dst: u64,
    ephemeral_src: u64,
}

impl WindowAggregates {
    pub fn new(port_cardinality_cap: usize) -> Self {
        Self {
            records: 0,
            fwd_bytes: 0,
            bwd_bytes: 0,
            fwd_packets: 0,
            bwd_packets: 0,
            syn: 0,
            ack: 0,
            fin: 0,
            rst: 0,
            psh: 0,
            urg: 0,
            flow_sizes: Moments::default(),
            durations: Moments::default(),
            inter_arrivals: Moments::default(),
            last_t_end_ms: None,
            first_t_end_ms: None,
            max_t_end_ms: 0,
            dst_ports: CategoricalCounter::new(port_cardinality_cap),
            protocols: [0; 4],
            well_known_dst: 0,
            ephemeral_src: 0,
        }
    }

    pub fn observe(&mut self, record: &CommonRecord) {
        self.records += 1;
        self.fwd_bytes = self.fwd_bytes.saturating_add(record.fwd_bytes);
        self.bwd_bytes = self.bwd_bytes.saturating_add(record.bwd_bytes);
        self.fwd_packets = self.fwd_packets.saturating_add(record.fwd_packets);
        self.bwd_packets = self.bwd_packets.saturating_add(record.bwd_packets);

        self.syn = self.syn.saturating_add(record.flags.syn as u64);
        self.ack = self.ack.saturating_add(record.flags.ack as u64);
        self.fin = self.fin.saturating_add(record.flags.fin as u64);
        self.rst = self.rst.saturating_add(record.flags.rst as u64);
        self.psh = self.psh.saturating_add(record.flags.psh as u64);
        self.urg = self.urg.saturating_add(record.flags.urg as u64);

        self.flow_sizes.observe(record.total_bytes() as f64);
        self.durations.observe(record.duration_ms() as f64);
        if let Some(last) = self.last_t_end_ms {
            self.inter_arrivals
                .observe((record.t_end_unix_ms - last).max(0) as f64);
        }
        self.last_t_end_ms = Some(record.t_end_unix_ms);
        if self.first_t_end_ms.is_none() {
            self.first_t_end_ms = Some(record.t_end_unix_ms);
        }
        self.max_t_end_ms = self.max_t_end_ms.max(record.t_end_unix_ms);

        self.dst_ports.observe(record.tuple.dst_port);
        self.protocols[protocol_bucket(record.tuple.protocol)] += 1;
        if record.tuple.dst_port < 1024 {
            self.well_known_dst += 1;
        }
        if record.tuple.src_port >= 49_152 {
            self.ephemeral_src += 1;
        }
    }

    pub fn record_count(&self) -> u64 {
        self.records
    }

    pub fn top_dst_port(&self) -> u16 {
        self.dst_ports.most_frequent().unwrap_or(0)
    }

    pub fn dominant_protocol(&self) -> Protocol {
        let best = self
            .protocols
            .iter()
            .enumerate()
            .max_by_key(|(_, count)| **count)
            .map(|(bucket, _)| bucket)
            .unwrap_or(3);
        match best {
            0 => Protocol::Tcp,
            1 => Protocol::Udp,
            2 => Protocol::Icmp,
            _ => Protocol::Other(0),
        }
    }

    pub fn last_t_end_ms(&self) -> Option<i64> {
        self.last_t_end_ms
    }

    /// Materialize the aggregate state into the documented slot layout.
    /// `span_ms` is the window span used for rate denominators.
    pub fn finalize(&self, span_ms: i64) -> FeatureVector {
        let mut slots = [0.0f64; FEATURE_SLOT_COUNT];
        let span_s = (span_ms.max(1)) as f64 / 1_000.0;

        let total_bytes = self.fwd_bytes.saturating_add(self.bwd_bytes);
        let total_packets = self.fwd_packets.saturating_add(self.bwd_packets);

        slots[slot::RECORD_COUNT] = norm(self.records as f64, layout::CAP_RECORDS);
        slots[slot::BYTE_TOTAL] = norm(total_bytes as f64, layout::CAP_BYTES);
        slots[slot::PACKET_TOTAL] = norm(total_packets as f64, layout::CAP_PACKETS);
        slots[slot::BYTES_PER_PACKET] = norm(
            ratio(total_bytes as f64, total_packets as f64),
            layout::CAP_PACKET_SIZE,
        );
        slots[slot::BYTE_RATE] = norm(total_bytes as f64 / span_s, layout::CAP_BYTE_RATE);
        slots[slot::PACKET_RATE] = norm(total_packets as f64 / span_s, layout::CAP_PACKET_RATE);
        slots[slot::FLOW_SIZE_MEAN] = norm(self.flow_sizes.mean(), layout::CAP_FLOW_SIZE);
        slots[slot::FLOW_SIZE_STD] = norm(self.flow_sizes.stddev(), layout::CAP_FLOW_SIZE);
        slots[slot::FWD_BYTE_RATIO] = ratio_or(self.fwd_bytes as f64, total_bytes as f64, 0.5);
        slots[slot::FWD_PACKET_RATIO] =
            ratio_or(self.fwd_packets as f64, total_packets as f64, 0.5);

        let packet_denom = (total_packets.max(1)) as f64;
        slots[slot::SYN_RATIO] = (self.syn as f64 / packet_denom).clamp(0.0, 1.0);
        slots[slot::ACK_RATIO] = (self.ack as f64 / packet_denom).clamp(0.0, 1.0);
        slots[slot::FIN_RATIO] = (self.fin as f64 / packet_denom).clamp(0.0, 1.0);
        slots[slot::RST_RATIO] = (self.rst as f64 / packet_denom).clamp(0.0, 1.0);
        slots[slot::PSH_RATIO] = (self.psh as f64 / packet_denom).clamp(0.0, 1.0);
        slots[slot::URG_RATIO] = (self.urg as f64 / packet_denom).clamp(0.0, 1.0);

        slots[slot::DST_PORT_ENTROPY] = self.dst_ports.normalized_entropy();
        slots[slot::PROTOCOL_ENTROPY] = protocol_entropy(&self.protocols);
        slots[slot::UNIQUE_DST_PORTS] =
            norm(self.dst_ports.distinct() as f64, layout::CAP_UNIQUE_PORTS);
        slots[slot::FLOW_DURATION_MEAN] = norm(self.durations.mean(), layout::CAP_DURATION_MS);
        slots[slot::IAT_MEAN] = norm(self.inter_arrivals.mean(), layout::CAP_IAT_MS);
        slots[slot::IAT_STD] = norm(self.inter_arrivals.stddev(), layout::CAP_IAT_MS);

        let record_denom = (self.records.max(1)) as f64;
        slots[slot::WELL_KNOWN_PORT_RATIO] = self.well_known_dst as f64 / record_denom;
        slots[slot::EPHEMERAL_PORT_RATIO] = self.ephemeral_src as f64 / record_denom;

        FeatureVector { slots }
    }
}

fn protocol_bucket(protocol: Protocol) -> usize {
    match protocol {
        Protocol::Tcp => 0,
        Protocol::Udp => 1,
        Protocol::Icmp => 2,
        Protocol::Other(_) => 3,
    }
}

fn protocol_entropy(counts: &[u64; 4]) -> f64 {
    let total: u64 = counts.iter().sum();
    if total == 0 {
        return 0.0;
    }
    let mut bits = 0.0;
    for &count in counts {
        if count > 0 {
            let p = count as f64 / total as f64;
            bits -= p * p.log2();
        }
    }
    (bits / 2.0).clamp(0.0, 1.0)
}

fn norm(value: f64, cap: f64) -> f64 {
    (value / cap).clamp(0.0, 1.0)
}

fn ratio(num: f64, denom: f64) -> f64 {
    if denom <= 0.0 {
        0.0
    } else {
        num / denom
    }
}

fn ratio_or(num: f64, denom: f64, default: f64) -> f64 {
    if denom <= 0.0 {
        default
    } else {
        (num / denom).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest::{FiveTuple, Framing, RecordOrigin, TcpFlagCounts};

    fn record(t_end: i64, dst_port: u16, syn: u32, bytes: u64) -> CommonRecord {
        CommonRecord {
            record_id: "rec_test".to_string(),
            t_start_unix_ms: t_end - 100,
            t_end_unix_ms: t_end,
            tuple: FiveTuple {
                src_addr: "203.0.113.7".parse().expect("addr"),
                src_port: 50_000,
                dst_addr: "10.0.0.5".parse().expect("addr"),
                dst_port,
                protocol: Protocol::Tcp,
            },
            fwd_bytes: bytes,
            bwd_bytes: 0,
            fwd_packets: 1,
            bwd_packets: 0,
            flags: TcpFlagCounts {
                syn,
                ..TcpFlagCounts::default()
            },
            origin: RecordOrigin {
                framing: Framing::PacketSummary,
                sensor_id: "s1".to_string(),
                flow_id: 0,
            },
        }
    }

    #[test]
    fn moments_match_direct_computation() {
        let mut m = Moments::default();
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            m.observe(v);
        }
        assert!((m.mean() - 5.0).abs() < 1e-9);
        assert!((m.variance() - 4.571428571428571).abs() < 1e-9);
    }

    #[test]
    fn syn_flood_shape_shows_in_slots() {
        let mut agg = WindowAggregates::new(64);
        for i in 0..200 {
            agg.observe(&record(1_700_000_000_000 + i * 150, 80, 1, 60));
        }
        let vector = agg.finalize(30_000);
        assert!(vector.is_well_formed());
        assert!(vector.get(slot::SYN_RATIO) > 0.9);
        assert!(vector.get(slot::ACK_RATIO) < 0.1);
        assert_eq!(agg.top_dst_port(), 80);
        assert!(vector.get(slot::DST_PORT_ENTROPY) < 0.01);
    }

    #[test]
    fn entropy_rises_with_port_spread() {
        let mut focused = WindowAggregates::new(64);
        let mut spread = WindowAggregates::new(64);
        for i in 0..64u16 {
            focused.observe(&record(1_700_000_000_000 + i as i64, 443, 0, 500));
            spread.observe(&record(1_700_000_000_000 + i as i64, 1000 + i, 0, 500));
        }
        assert!(
            spread.finalize(10_000).get(slot::DST_PORT_ENTROPY)
                > focused.finalize(10_000).get(slot::DST_PORT_ENTROPY)
        );
    }

    #[test]
    fn categorical_counter_bounds_cardinality() {
        let mut counter = CategoricalCounter::new(4);
        for port in 0..100u16 {
            counter.observe(port);
        }
        assert_eq!(counter.distinct(), 5);
        let entropy = counter.normalized_entropy();
        assert!(entropy > 0.0 && entropy <= 1.0);
    }
}
