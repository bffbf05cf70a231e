use std::net::IpAddr;

use ingest::CommonRecord;
use serde::{Deserialize, Serialize};

/// Window kinds, ordered for close tie-breaking: when several windows on the
/// same key close at once, tumbling closes first, then sliding, then session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WindowKind {
    Tumbling,
    Sliding,
    Session,
}

impl WindowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tumbling => "tumbling",
            Self::Sliding => "sliding",
            Self::Session => "session",
        }
    }
}

/// Projections of a record into a window key. Every projection keys on the
/// source address so per-source ordering from the bus carries through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyProjection {
    SrcAddr,
    SrcAddrDstPort,
}

impl KeyProjection {
    pub fn project(&self, record: &CommonRecord) -> WindowKey {
        match self {
            Self::SrcAddr => WindowKey::SrcAddr(record.tuple.src_addr),
            Self::SrcAddrDstPort => {
                WindowKey::SrcAddrDstPort(record.tuple.src_addr, record.tuple.dst_port)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowKey {
    SrcAddr(IpAddr),
    SrcAddrDstPort(IpAddr, u16),
}

impl WindowKey {
    pub fn src_addr(&self) -> IpAddr {
        match self {
            Self::SrcAddr(addr) => *addr,
            Self::SrcAddrDstPort(addr, _) => *addr,
        }
    }

    pub fn dst_port(&self) -> Option<u16> {
        match self {
            Self::SrcAddr(_) => None,
            Self::SrcAddrDstPort(_, port) => Some(*port),
        }
    }
}

/// One configured window shape. `slide_ms` only applies to sliding windows,
/// `gap_ms` only to session windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowSpec {
    pub kind: WindowKind,
    pub span_ms: i64,
    pub slide_ms: Option<i64>,
    pub gap_ms: Option<i64>,
}

impl WindowSpec {
    pub fn tumbling(span_ms: i64) -> Self {
        Self {
            kind: WindowKind::Tumbling,
            span_ms,
            slide_ms: None,
            gap_ms: None,
        }
    }

    pub fn sliding(span_ms: i64, slide_ms: i64) -> Self {
        Self {
            kind: WindowKind::Sliding,
            span_ms,
            slide_ms: Some(slide_ms),
            gap_ms: None,
        }
    }

    pub fn session(gap_ms: i64) -> Self {
        Self {
            kind: WindowKind::Session,
            span_ms: 0,
            slide_ms: None,
            gap_ms: Some(gap_ms),
        }
    }

    pub fn slide(&self) -> i64 {
        self.slide_ms.unwrap_or(self.span_ms).max(1)
    }

    pub fn gap(&self) -> i64 {
        self.gap_ms.unwrap_or(30_000).max(1)
    }

    /// Aligned start of the tumbling window containing `t`. A record with
    /// `t_end` exactly on a boundary belongs to the window starting there.
    pub fn tumbling_start(&self, t_ms: i64) -> i64 {
        let span = self.span_ms.max(1);
        t_ms.div_euclid(span) * span
    }

    /// Starts of every sliding window covering `t`.
    pub fn sliding_starts(&self, t_ms: i64) -> Vec<i64> {
        let span = self.span_ms.max(1);
        let slide = self.slide();
        let newest = t_ms.div_euclid(slide) * slide;
        let mut starts = Vec::new();
        let mut start = newest;
        while start > t_ms - span {
            starts.push(start);
            start -= slide;
        }
        starts
    }
}
