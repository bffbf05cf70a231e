use std::net::{IpAddr, Ipv4Addr};

use crate::error::{ParseError, ParseResult};
use crate::normalize::RawFlow;
use crate::record::{Framing, TcpFlagCounts};

const HEADER_LEN: usize = 24;
const RECORD_LEN: usize = 48;
const SUPPORTED_VERSION: u16 = 5;

/// Binary flow-export framing: a 24-byte header followed by `count` 48-byte
/// records. Record timestamps are router-uptime offsets; the header carries
/// the export wall-clock used to rebase them to unix time.
pub fn parse_flow_v5(data: &[u8], sensor_id: &str) -> ParseResult<Vec<RawFlow>> {
    if data.len() < HEADER_LEN {
        return Err(ParseError::Truncated {
            framing: "flow_v5",
            need: HEADER_LEN,
            got: data.len(),
        });
    }

    let version = read_u16(data, 0);
    if version != SUPPORTED_VERSION {
        return Err(ParseError::UnsupportedVersion(version));
    }

    let count = read_u16(data, 2) as usize;
    let sys_uptime_ms = read_u32(data, 4) as i64;
    let unix_secs = read_u32(data, 8) as i64;
    let unix_nsecs = read_u32(data, 12) as i64;
    let flow_sequence = read_u32(data, 16) as u64;

    let need = HEADER_LEN + count * RECORD_LEN;
    if data.len() < need {
        return Err(ParseError::Truncated {
            framing: "flow_v5",
            need,
            got: data.len(),
        });
    }

    // Uptime 0 corresponds to this wall-clock instant.
    let export_unix_ms = unix_secs.saturating_mul(1000) + unix_nsecs / 1_000_000;
    let boot_unix_ms = export_unix_ms.saturating_sub(sys_uptime_ms);

    let mut flows = Vec::with_capacity(count);
    for index in 0..count {
        let base = HEADER_LEN + index * RECORD_LEN;
        let record = &data[base..base + RECORD_LEN];

        let src_addr = IpAddr::V4(Ipv4Addr::from(read_u32(record, 0)));
        let dst_addr = IpAddr::V4(Ipv4Addr::from(read_u32(record, 4)));
        let packets = read_u32(record, 16) as u64;
        let bytes = read_u32(record, 20) as u64;
        let first_uptime_ms = read_u32(record, 24) as i64;
        let last_uptime_ms = read_u32(record, 28) as i64;
        let src_port = read_u16(record, 32);
        let dst_port = read_u16(record, 34);
        let tcp_flags = record[37];
        let protocol = record[38];

        flows.push(RawFlow {
            framing: Framing::FlowV5,
            sensor_id: sensor_id.to_string(),
            flow_id: flow_sequence.wrapping_add(index as u64),
            t_start_unix_ms: boot_unix_ms + first_uptime_ms,
            t_end_unix_ms: boot_unix_ms + last_uptime_ms,
            src_addr,
            src_port,
            dst_addr,
            dst_port,
            protocol,
            fwd_bytes: bytes,
            bwd_bytes: 0,
            fwd_packets: packets,
            bwd_packets: 0,
            flags: TcpFlagCounts::from_control_bits(tcp_flags),
        });
    }

    Ok(flows)
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

#[cfg(test)]
pub(crate) fn build_frame(records: &[(Ipv4Addr, u16, Ipv4Addr, u16, u8, u32, u32, u8)]) -> Vec<u8> {
    // Header: export at unix 1_700_000_000s with 10s of uptime.
    let mut frame = Vec::new();
    frame.extend_from_slice(&SUPPORTED_VERSION.to_be_bytes());
    frame.extend_from_slice(&(records.len() as u16).to_be_bytes());
    frame.extend_from_slice(&10_000u32.to_be_bytes());
    frame.extend_from_slice(&1_700_000_000u32.to_be_bytes());
    frame.extend_from_slice(&0u32.to_be_bytes());
    frame.extend_from_slice(&77u32.to_be_bytes());
    frame.extend_from_slice(&[0u8; 4]);

    for (src, sport, dst, dport, proto, packets, bytes, flags) in records {
        let mut record = [0u8; RECORD_LEN];
        record[0..4].copy_from_slice(&src.octets());
        record[4..8].copy_from_slice(&dst.octets());
        record[16..20].copy_from_slice(&packets.to_be_bytes());
        record[20..24].copy_from_slice(&bytes.to_be_bytes());
        record[24..28].copy_from_slice(&1_000u32.to_be_bytes());
        record[28..32].copy_from_slice(&9_000u32.to_be_bytes());
        record[32..34].copy_from_slice(&sport.to_be_bytes());
        record[34..36].copy_from_slice(&dport.to_be_bytes());
        record[37] = *flags;
        record[38] = *proto;
        frame.extend_from_slice(&record);
    }

    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_header_and_records() {
        let frame = build_frame(&[(
            Ipv4Addr::new(203, 0, 113, 7),
            50_000,
            Ipv4Addr::new(10, 0, 0, 5),
            80,
            6,
            3,
            180,
            0x02,
        )]);

        let flows = parse_flow_v5(&frame, "edge-1").expect("parse");
        assert_eq!(flows.len(), 1);
        let flow = &flows[0];
        assert_eq!(flow.src_addr.to_string(), "203.0.113.7");
        assert_eq!(flow.dst_port, 80);
        assert_eq!(flow.fwd_packets, 3);
        assert_eq!(flow.fwd_bytes, 180);
        assert_eq!(flow.flags.syn, 1);
        assert_eq!(flow.flow_id, 77);
        // boot = 1_700_000_000_000 - 10_000; first at +1_000, last at +9_000.
        assert_eq!(flow.t_start_unix_ms, 1_699_999_991_000);
        assert_eq!(flow.t_end_unix_ms, 1_699_999_999_000);
    }

    #[test]
    fn rejects_wrong_version() {
        let mut frame = build_frame(&[]);
        frame[0] = 0;
        frame[1] = 9;
        assert!(matches!(
            parse_flow_v5(&frame, "edge-1"),
            Err(ParseError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn rejects_truncated_records() {
        let mut frame = build_frame(&[(
            Ipv4Addr::new(1, 2, 3, 4),
            1,
            Ipv4Addr::new(5, 6, 7, 8),
            2,
            17,
            1,
            64,
            0,
        )]);
        frame.truncate(HEADER_LEN + 10);
        assert!(matches!(
            parse_flow_v5(&frame, "edge-1"),
            Err(ParseError::Truncated { .. })
        ));
    }
}
