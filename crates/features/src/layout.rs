//! Feature vector slot contract.
//!
//! The vector is a fixed-length ordered array; detectors and artifacts are
//! trained against this exact layout. Changing the slot count or order is a
//! breaking change and requires a new artifact major version.

pub const FEATURE_SLOT_COUNT: usize = 24;

/// Slot indices. Keep in sync with `SLOT_DOCS`.
pub mod slot {
    pub const RECORD_COUNT: usize = 0;
    pub const BYTE_TOTAL: usize = 1;
    pub const PACKET_TOTAL: usize = 2;
    pub const BYTES_PER_PACKET: usize = 3;
    pub const BYTE_RATE: usize = 4;
    pub const PACKET_RATE: usize = 5;
    pub const FLOW_SIZE_MEAN: usize = 6;
    pub const FLOW_SIZE_STD: usize = 7;
    pub const FWD_BYTE_RATIO: usize = 8;
    pub const FWD_PACKET_RATIO: usize = 9;
    pub const SYN_RATIO: usize = 10;
    pub const ACK_RATIO: usize = 11;
    pub const FIN_RATIO: usize = 12;
    pub const RST_RATIO: usize = 13;
    pub const PSH_RATIO: usize = 14;
    pub const URG_RATIO: usize = 15;
    pub const DST_PORT_ENTROPY: usize = 16;
    pub const PROTOCOL_ENTROPY: usize = 17;
    pub const UNIQUE_DST_PORTS: usize = 18;
    pub const FLOW_DURATION_MEAN: usize = 19;
    pub const IAT_MEAN: usize = 20;
    pub const IAT_STD: usize = 21;
    pub const WELL_KNOWN_PORT_RATIO: usize = 22;
    pub const EPHEMERAL_PORT_RATIO: usize = 23;
}

/// `(name, min, max, meaning)` per slot. Every slot is normalized into
/// [0, 1]; the caps used for normalization are part of the contract.
pub const SLOT_DOCS: [(&str, f64, f64, &str); FEATURE_SLOT_COUNT] = [
    ("record_count", 0.0, 1.0, "records in window / 1000"),
    ("byte_total", 0.0, 1.0, "total bytes / 10 MB"),
    ("packet_total", 0.0, 1.0, "total packets / 10000"),
    ("bytes_per_packet", 0.0, 1.0, "mean packet size / 1500 B"),
    ("byte_rate", 0.0, 1.0, "bytes per second / 1 MB/s"),
    ("packet_rate", 0.0, 1.0, "packets per second / 10000"),
    ("flow_size_mean", 0.0, 1.0, "mean bytes per record / 100 kB"),
    ("flow_size_std", 0.0, 1.0, "stddev of bytes per record / 100 kB"),
    ("fwd_byte_ratio", 0.0, 1.0, "forward bytes / total bytes"),
    ("fwd_packet_ratio", 0.0, 1.0, "forward packets / total packets"),
    ("syn_ratio", 0.0, 1.0, "SYN count / total packets"),
    ("ack_ratio", 0.0, 1.0, "ACK count / total packets"),
    ("fin_ratio", 0.0, 1.0, "FIN count / total packets"),
    ("rst_ratio", 0.0, 1.0, "RST count / total packets"),
    ("psh_ratio", 0.0, 1.0, "PSH count / total packets"),
    ("urg_ratio", 0.0, 1.0, "URG count / total packets"),
    ("dst_port_entropy", 0.0, 1.0, "normalized entropy of destination ports"),
    ("protocol_entropy", 0.0, 1.0, "normalized entropy over tcp/udp/icmp/other"),
    ("unique_dst_ports", 0.0, 1.0, "distinct destination ports / 256"),
    ("flow_duration_mean", 0.0, 1.0, "mean record duration / 60 s"),
    ("iat_mean", 0.0, 1.0, "mean record inter-arrival / 10 s"),
    ("iat_std", 0.0, 1.0, "stddev of record inter-arrival / 10 s"),
    ("well_known_port_ratio", 0.0, 1.0, "records with dst port < 1024"),
    ("ephemeral_port_ratio", 0.0, 1.0, "records with src port >= 49152"),
];

pub fn slot_name(index: usize) -> &'static str {
    SLOT_DOCS.get(index).map(|d| d.0).unwrap_or("unknown")
}

// Normalization caps referenced by SLOT_DOCS.
pub(crate) const CAP_RECORDS: f64 = 1_000.0;
pub(crate) const CAP_BYTES: f64 = 10_000_000.0;
pub(crate) const CAP_PACKETS: f64 = 10_000.0;
pub(crate) const CAP_PACKET_SIZE: f64 = 1_500.0;
pub(crate) const CAP_BYTE_RATE: f64 = 1_000_000.0;
pub(crate) const CAP_PACKET_RATE: f64 = 10_000.0;
pub(crate) const CAP_FLOW_SIZE: f64 = 100_000.0;
pub(crate) const CAP_UNIQUE_PORTS: f64 = 256.0;
pub(crate) const CAP_DURATION_MS: f64 = 60_000.0;
pub(crate) const CAP_IAT_MS: f64 = 10_000.0;
