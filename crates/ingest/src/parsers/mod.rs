mod flow_json;
mod flow_v5;
mod host_event;
mod packet_summary;

pub use flow_json::parse_flow_json;
pub use flow_v5::parse_flow_v5;
pub use host_event::parse_host_events;
pub use packet_summary::parse_packet_summaries;

use crate::error::ParseResult;
use crate::normalize::RawFlow;
use crate::record::Framing;

/// Dispatch a frame of collector bytes to the parser for its framing.
pub fn parse_frame(framing: Framing, data: &[u8], sensor_id: &str) -> ParseResult<Vec<RawFlow>> {
    match framing {
        Framing::PacketSummary => parse_packet_summaries(data, sensor_id),
        Framing::FlowV5 => parse_flow_v5(data, sensor_id),
        Framing::FlowJson => parse_flow_json(data, sensor_id),
        Framing::HostEvent => parse_host_events(data, sensor_id),
    }
}
