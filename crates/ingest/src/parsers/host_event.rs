use std::net::IpAddr;

use serde::Deserialize;

use crate::error::{ParseError, ParseResult};
use crate::normalize::RawFlow;
use crate::record::{Framing, TcpFlagCounts};

/// Socket telemetry from host sensors, one JSON event per line. Only
/// connection events carry flow semantics; other event kinds are skipped.
#[derive(Debug, Deserialize)]
struct HostEvent {
    ts_ms: i64,
    event: String,
    #[serde(default)]
    sensor: Option<String>,
    laddr: Option<String>,
    #[serde(default)]
    lport: u16,
    raddr: Option<String>,
    #[serde(default)]
    rport: u16,
    #[serde(default)]
    proto: Option<String>,
    #[serde(default)]
    bytes_out: u64,
    #[serde(default)]
    bytes_in: u64,
    #[serde(default)]
    event_id: u64,
}

pub fn parse_host_events(data: &[u8], sensor_id: &str) -> ParseResult<Vec<RawFlow>> {
    let text = std::str::from_utf8(data)
        .map_err(|_| ParseError::BadAddress("frame is not utf-8".to_string()))?;

    let mut flows = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let event: HostEvent = serde_json::from_str(line)?;
        if !matches!(event.event.as_str(), "socket_connect" | "socket_close") {
            continue;
        }

        let local = event.laddr.as_deref().ok_or(ParseError::MissingField("laddr"))?;
        let remote = event.raddr.as_deref().ok_or(ParseError::MissingField("raddr"))?;
        let local_addr: IpAddr = local
            .parse()
            .map_err(|_| ParseError::BadAddress(local.to_string()))?;
        let remote_addr: IpAddr = remote
            .parse()
            .map_err(|_| ParseError::BadAddress(remote.to_string()))?;

        // The host is the vantage point: outbound bytes flow from the local
        // socket toward the remote peer.
        flows.push(RawFlow {
            framing: Framing::HostEvent,
            sensor_id: event
                .sensor
                .clone()
                .unwrap_or_else(|| sensor_id.to_string()),
            flow_id: event.event_id,
            t_start_unix_ms: event.ts_ms,
            t_end_unix_ms: event.ts_ms,
            src_addr: local_addr,
            src_port: event.lport,
            dst_addr: remote_addr,
            dst_port: event.rport,
            protocol: protocol_number(event.proto.as_deref()),
            fwd_bytes: event.bytes_out,
            bwd_bytes: event.bytes_in,
            fwd_packets: 0,
            bwd_packets: 0,
            flags: TcpFlagCounts::default(),
        });
    }

    Ok(flows)
}

fn protocol_number(raw: Option<&str>) -> u8 {
    match raw.map(|p| p.to_ascii_lowercase()).as_deref() {
        Some("tcp") => 6,
        Some("udp") => 17,
        Some("icmp") => 1,
        _ => 0,
    }
}
