use std::net::IpAddr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Other(u8),
}

impl Protocol {
    pub fn from_number(number: u8) -> Self {
        match number {
            6 => Self::Tcp,
            17 => Self::Udp,
            1 => Self::Icmp,
            other => Self::Other(other),
        }
    }

    pub fn number(&self) -> u8 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
            Self::Icmp => 1,
            Self::Other(n) => *n,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Icmp => "icmp",
            Self::Other(_) => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FiveTuple {
    pub src_addr: IpAddr,
    pub src_port: u16,
    pub dst_addr: IpAddr,
    pub dst_port: u16,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpFlagCounts {
    pub syn: u32,
    pub ack: u32,
    pub fin: u32,
    pub rst: u32,
    pub psh: u32,
    pub urg: u32,
}

impl TcpFlagCounts {
    /// Presence counts from a cumulative TCP control-bits mask. Flow framings
    /// report an OR of all flags seen, so each present flag counts once.
    pub fn from_control_bits(bits: u8) -> Self {
        Self {
            fin: (bits & 0x01 != 0) as u32,
            syn: (bits & 0x02 != 0) as u32,
            rst: (bits & 0x04 != 0) as u32,
            psh: (bits & 0x08 != 0) as u32,
            ack: (bits & 0x10 != 0) as u32,
            urg: (bits & 0x20 != 0) as u32,
        }
    }

    pub fn total(&self) -> u64 {
        self.syn as u64
            + self.ack as u64
            + self.fin as u64
            + self.rst as u64
            + self.psh as u64
            + self.urg as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Framing {
    PacketSummary,
    FlowV5,
    FlowJson,
    HostEvent,
}

impl Framing {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PacketSummary => "packet_summary",
            Self::FlowV5 => "flow_v5",
            Self::FlowJson => "flow_json",
            Self::HostEvent => "host_event",
        }
    }
}

/// Capture provenance carried on every normalized record. The
/// `(sensor_id, flow_id, t_end)` triple is the dedup identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOrigin {
    pub framing: Framing,
    pub sensor_id: String,
    pub flow_id: u64,
}

/// Normalized flow record. Immutable after creation; everything downstream
/// of ingest consumes this shape regardless of collector framing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommonRecord {
    pub record_id: String,
    pub t_start_unix_ms: i64,
    pub t_end_unix_ms: i64,
    pub tuple: FiveTuple,
    pub fwd_bytes: u64,
    pub bwd_bytes: u64,
    pub fwd_packets: u64,
    pub bwd_packets: u64,
    pub flags: TcpFlagCounts,
    pub origin: RecordOrigin,
}

impl CommonRecord {
    pub fn duration_ms(&self) -> i64 {
        self.t_end_unix_ms.saturating_sub(self.t_start_unix_ms)
    }

    pub fn total_bytes(&self) -> u64 {
        self.fwd_bytes.saturating_add(self.bwd_bytes)
    }

    pub fn total_packets(&self) -> u64 {
        self.fwd_packets.saturating_add(self.bwd_packets)
    }

    /// Routing key for the normalized topic: records from one source address
    /// always share a partition, preserving per-source ordering.
    pub fn partition_key(&self) -> Vec<u8> {
        self.tuple.src_addr.to_string().into_bytes()
    }
}
