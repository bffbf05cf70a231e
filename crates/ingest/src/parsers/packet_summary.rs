use std::net::IpAddr;

use serde::Deserialize;

use crate::error::{ParseError, ParseResult};
use crate::normalize::RawFlow;
use crate::record::{Framing, TcpFlagCounts};

/// Per-packet summaries from a capture bridge, one JSON object per line.
/// Each packet becomes a single-packet flow; the feature engine aggregates
/// them back into windows.
#[derive(Debug, Deserialize)]
struct PacketSummary {
    ts_ms: i64,
    src: String,
    #[serde(default)]
    sport: u16,
    dst: String,
    #[serde(default)]
    dport: u16,
    proto: u8,
    len: u64,
    #[serde(default)]
    flags: PacketFlags,
    #[serde(default)]
    seq: u64,
}

#[derive(Debug, Default, Deserialize)]
struct PacketFlags {
    #[serde(default)]
    syn: bool,
    #[serde(default)]
    ack: bool,
    #[serde(default)]
    fin: bool,
    #[serde(default)]
    rst: bool,
    #[serde(default)]
    psh: bool,
    #[serde(default)]
    urg: bool,
}

pub fn parse_packet_summaries(data: &[u8], sensor_id: &str) -> ParseResult<Vec<RawFlow>> {
    let text = std::str::from_utf8(data)
        .map_err(|_| ParseError::BadAddress("frame is not utf-8".to_string()))?;

    let mut flows = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let packet: PacketSummary = serde_json::from_str(line)?;

        let src_addr: IpAddr = packet
            .src
            .parse()
            .map_err(|_| ParseError::BadAddress(packet.src.clone()))?;
        let dst_addr: IpAddr = packet
            .dst
            .parse()
            .map_err(|_| ParseError::BadAddress(packet.dst.clone()))?;

        flows.push(RawFlow {
            framing: Framing::PacketSummary,
            sensor_id: sensor_id.to_string(),
            flow_id: packet.seq,
            t_start_unix_ms: packet.ts_ms,
            t_end_unix_ms: packet.ts_ms,
            src_addr,
            src_port: packet.sport,
            dst_addr,
            dst_port: packet.dport,
            protocol: packet.proto,
            fwd_bytes: packet.len,
            bwd_bytes: 0,
            fwd_packets: 1,
            bwd_packets: 0,
            flags: TcpFlagCounts {
                syn: packet.flags.syn as u32,
                ack: packet.flags.ack as u32,
                fin: packet.flags.fin as u32,
                rst: packet.flags.rst as u32,
                psh: packet.flags.psh as u32,
                urg: packet.flags.urg as u32,
            },
        });
    }

    Ok(flows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_packet_becomes_a_single_packet_flow() {
        let frame = concat!(
            r#"{"ts_ms":1700000000100,"src":"203.0.113.7","sport":40001,"dst":"10.0.0.5","#,
            r#""dport":80,"proto":6,"len":60,"flags":{"syn":true},"seq":1}"#,
            "\n",
            r#"{"ts_ms":1700000000150,"src":"203.0.113.7","sport":40002,"dst":"10.0.0.5","#,
            r#""dport":80,"proto":6,"len":60,"flags":{"syn":true},"seq":2}"#,
        );

        let flows = parse_packet_summaries(frame.as_bytes(), "cap-1").expect("parse");
        assert_eq!(flows.len(), 2);
        assert_eq!(flows[0].fwd_packets, 1);
        assert_eq!(flows[0].t_start_unix_ms, flows[0].t_end_unix_ms);
        assert_eq!(flows[0].flags.syn, 1);
        assert_eq!(flows[0].flags.ack, 0);
        assert_eq!(flows[1].flow_id, 2);
    }

    #[test]
    fn missing_flags_default_to_zero() {
        let frame =
            r#"{"ts_ms":1700000000100,"src":"10.0.0.9","dst":"10.0.0.5","proto":17,"len":120}"#;
        let flows = parse_packet_summaries(frame.as_bytes(), "cap-1").expect("parse");
        assert_eq!(flows[0].flags.total(), 0);
        assert_eq!(flows[0].src_port, 0);
    }
}
