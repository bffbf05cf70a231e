//! Flow ingestion: heterogeneous collector framings in, `CommonRecord`s out
//! on the normalized bus topic, partitioned by source address.

mod counters;
mod dedup;
mod error;
mod normalize;
mod parsers;
mod publisher;
mod record;

pub use counters::{IngestCounters, RateGauge};
pub use dedup::{DedupKey, DedupVerdict, Deduper};
pub use error::{ParseError, ParseResult};
pub use normalize::{Normalizer, RawFlow};
pub use parsers::{
    parse_flow_json, parse_flow_v5, parse_frame, parse_host_events, parse_packet_summaries,
};
pub use publisher::{IngestConfig, IngestStage};
pub use record::{
    CommonRecord, FiveTuple, Framing, Protocol, RecordOrigin, TcpFlagCounts,
};
