use std::net::IpAddr;

use serde::Deserialize;

use crate::error::{ParseError, ParseResult};
use crate::normalize::RawFlow;
use crate::record::{Framing, TcpFlagCounts};

/// One flow per line, IPFIX-style field names. Unknown fields are ignored so
/// exporters can carry extra enterprise elements.
#[derive(Debug, Deserialize)]
struct JsonFlow {
    #[serde(rename = "sourceIPv4Address", alias = "sourceIPv6Address")]
    source_address: String,
    #[serde(rename = "destinationIPv4Address", alias = "destinationIPv6Address")]
    destination_address: String,
    #[serde(rename = "sourceTransportPort", default)]
    source_port: u16,
    #[serde(rename = "destinationTransportPort", default)]
    destination_port: u16,
    #[serde(rename = "protocolIdentifier", default)]
    protocol: u8,
    #[serde(rename = "flowStartMilliseconds")]
    flow_start_ms: i64,
    #[serde(rename = "flowEndMilliseconds")]
    flow_end_ms: i64,
    #[serde(rename = "octetDeltaCount", default)]
    octets: u64,
    #[serde(rename = "packetDeltaCount", default)]
    packets: u64,
    #[serde(rename = "reverseOctetDeltaCount", default)]
    reverse_octets: u64,
    #[serde(rename = "reversePacketDeltaCount", default)]
    reverse_packets: u64,
    #[serde(rename = "tcpControlBits", default)]
    tcp_control_bits: u8,
    #[serde(rename = "flowId", default)]
    flow_id: u64,
    #[serde(rename = "exporterId", default)]
    exporter_id: Option<String>,
}

pub fn parse_flow_json(data: &[u8], sensor_id: &str) -> ParseResult<Vec<RawFlow>> {
    let text = std::str::from_utf8(data)
        .map_err(|_| ParseError::BadAddress("frame is not utf-8".to_string()))?;

    let mut flows = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let flow: JsonFlow = serde_json::from_str(line)?;

        let src_addr: IpAddr = flow
            .source_address
            .parse()
            .map_err(|_| ParseError::BadAddress(flow.source_address.clone()))?;
        let dst_addr: IpAddr = flow
            .destination_address
            .parse()
            .map_err(|_| ParseError::BadAddress(flow.destination_address.clone()))?;

        flows.push(RawFlow {
            framing: Framing::FlowJson,
            sensor_id: flow
                .exporter_id
                .clone()
                .unwrap_or_else(|| sensor_id.to_string()),
            flow_id: flow.flow_id,
            t_start_unix_ms: flow.flow_start_ms,
            t_end_unix_ms: flow.flow_end_ms,
            src_addr,
            src_port: flow.source_port,
            dst_addr,
            dst_port: flow.destination_port,
            protocol: flow.protocol,
            fwd_bytes: flow.octets,
            bwd_bytes: flow.reverse_octets,
            fwd_packets: flow.packets,
            bwd_packets: flow.reverse_packets,
            flags: TcpFlagCounts::from_control_bits(flow.tcp_control_bits),
        });
    }

    Ok(flows)
}
