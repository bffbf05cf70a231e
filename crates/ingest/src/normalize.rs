use std::net::IpAddr;

use uuid::Uuid;

use crate::error::{ParseError, ParseResult};
use crate::record::{CommonRecord, FiveTuple, Framing, Protocol, RecordOrigin, TcpFlagCounts};

/// Parser output before normalization. Field meanings follow the source
/// framing; the normalizer is what enforces the common shape.
#[derive(Debug, Clone)]
pub struct RawFlow {
    pub framing: Framing,
    pub sensor_id: String,
    pub flow_id: u64,
    pub t_start_unix_ms: i64,
    pub t_end_unix_ms: i64,
    pub src_addr: IpAddr,
    pub src_port: u16,
    pub dst_addr: IpAddr,
    pub dst_port: u16,
    pub protocol: u8,
    pub fwd_bytes: u64,
    pub bwd_bytes: u64,
    pub fwd_packets: u64,
    pub bwd_packets: u64,
    pub flags: TcpFlagCounts,
}

/// Timestamps after ~2001-09 in milliseconds; anything smaller is taken to
/// be seconds from a collector that didn't convert.
const MIN_PLAUSIBLE_UNIX_MS: i64 = 1_000_000_000_000;

#[derive(Debug, Clone, Default)]
pub struct Normalizer;

impl Normalizer {
    pub fn new() -> Self {
        Self
    }

    /// Turn a parsed flow into a `CommonRecord`. Normalization is a fixed
    /// point: applying the field rules to an already-normalized record
    /// changes nothing.
    pub fn normalize(&self, raw: RawFlow) -> ParseResult<CommonRecord> {
        let t_start = normalize_timestamp(raw.t_start_unix_ms);
        let t_end = normalize_timestamp(raw.t_end_unix_ms);
        if t_start <= 0 || t_end <= 0 {
            return Err(ParseError::BadTimeRange {
                start: raw.t_start_unix_ms,
                end: raw.t_end_unix_ms,
            });
        }
        // Collectors occasionally swap start/end on export.
        let (t_start, t_end) = if t_start <= t_end {
            (t_start, t_end)
        } else {
            (t_end, t_start)
        };

        let tuple = FiveTuple {
            src_addr: raw.src_addr,
            src_port: raw.src_port,
            dst_addr: raw.dst_addr,
            dst_port: raw.dst_port,
            protocol: Protocol::from_number(raw.protocol),
        };

        // A flow that moved bytes moved at least one packet.
        let fwd_packets = if raw.fwd_bytes > 0 {
            raw.fwd_packets.max(1)
        } else {
            raw.fwd_packets
        };
        let bwd_packets = if raw.bwd_bytes > 0 {
            raw.bwd_packets.max(1)
        } else {
            raw.bwd_packets
        };

        Ok(CommonRecord {
            record_id: new_record_id(),
            t_start_unix_ms: t_start,
            t_end_unix_ms: t_end,
            tuple,
            fwd_bytes: raw.fwd_bytes,
            bwd_bytes: raw.bwd_bytes,
            fwd_packets,
            bwd_packets,
            flags: raw.flags,
            origin: RecordOrigin {
                framing: raw.framing,
                sensor_id: raw.sensor_id,
                flow_id: raw.flow_id,
            },
        })
    }
}

fn normalize_timestamp(ts: i64) -> i64 {
    if ts > 0 && ts < MIN_PLAUSIBLE_UNIX_MS {
        ts.saturating_mul(1000)
    } else {
        ts
    }
}

fn new_record_id() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("rec_{}", &raw[..12])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(start: i64, end: i64) -> RawFlow {
        RawFlow {
            framing: Framing::FlowJson,
            sensor_id: "s1".to_string(),
            flow_id: 9,
            t_start_unix_ms: start,
            t_end_unix_ms: end,
            src_addr: "203.0.113.7".parse().expect("addr"),
            src_port: 4433,
            dst_addr: "10.0.0.5".parse().expect("addr"),
            dst_port: 80,
            protocol: 6,
            fwd_bytes: 600,
            bwd_bytes: 0,
            fwd_packets: 0,
            bwd_packets: 0,
            flags: TcpFlagCounts::default(),
        }
    }

    #[test]
    fn swaps_inverted_time_range() {
        let record = Normalizer::new()
            .normalize(raw(1_700_000_100_000, 1_700_000_000_000))
            .expect("normalize");
        assert!(record.t_start_unix_ms <= record.t_end_unix_ms);
    }

    #[test]
    fn promotes_second_timestamps_to_millis() {
        let record = Normalizer::new()
            .normalize(raw(1_700_000_000, 1_700_000_030))
            .expect("normalize");
        assert_eq!(record.t_start_unix_ms, 1_700_000_000_000);
        assert_eq!(record.t_end_unix_ms, 1_700_000_030_000);
    }

    #[test]
    fn bytes_imply_at_least_one_packet() {
        let record = Normalizer::new()
            .normalize(raw(1_700_000_000_000, 1_700_000_001_000))
            .expect("normalize");
        assert_eq!(record.fwd_packets, 1);
        assert_eq!(record.bwd_packets, 0);
    }

    #[test]
    fn rejects_nonpositive_timestamps() {
        let err = Normalizer::new().normalize(raw(0, 1_700_000_000_000));
        assert!(matches!(err, Err(ParseError::BadTimeRange { .. })));
    }

    #[test]
    fn normalization_is_a_fixed_point() {
        let normalizer = Normalizer::new();
        let first = normalizer
            .normalize(raw(1_700_000_000, 1_700_000_030))
            .expect("normalize");

        let again = normalizer
            .normalize(RawFlow {
                framing: first.origin.framing,
                sensor_id: first.origin.sensor_id.clone(),
                flow_id: first.origin.flow_id,
                t_start_unix_ms: first.t_start_unix_ms,
                t_end_unix_ms: first.t_end_unix_ms,
                src_addr: first.tuple.src_addr,
                src_port: first.tuple.src_port,
                dst_addr: first.tuple.dst_addr,
                dst_port: first.tuple.dst_port,
                protocol: first.tuple.protocol.number(),
                fwd_bytes: first.fwd_bytes,
                bwd_bytes: first.bwd_bytes,
                fwd_packets: first.fwd_packets,
                bwd_packets: first.bwd_packets,
                flags: first.flags,
            })
            .expect("normalize");

        assert_eq!(again.t_start_unix_ms, first.t_start_unix_ms);
        assert_eq!(again.t_end_unix_ms, first.t_end_unix_ms);
        assert_eq!(again.tuple, first.tuple);
        assert_eq!(again.fwd_bytes, first.fwd_bytes);
        assert_eq!(again.bwd_bytes, first.bwd_bytes);
        assert_eq!(again.fwd_packets, first.fwd_packets);
        assert_eq!(again.bwd_packets, first.bwd_packets);
    }
}
