use std::net::IpAddr;

use ingest::Protocol;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::layout::FEATURE_SLOT_COUNT;
use crate::window::{WindowKey, WindowKind};

/// Fixed-length ordered feature vector. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub slots: [f64; FEATURE_SLOT_COUNT],
}

impl FeatureVector {
    pub fn zeroed() -> Self {
        Self {
            slots: [0.0; FEATURE_SLOT_COUNT],
        }
    }

    pub fn get(&self, index: usize) -> f64 {
        self.slots.get(index).copied().unwrap_or(0.0)
    }

    /// Every slot finite and inside its documented [0, 1] range.
    pub fn is_well_formed(&self) -> bool {
        self.slots
            .iter()
            .all(|v| v.is_finite() && (0.0..=1.0).contains(v))
    }
}

/// Traceback context attached to an emitted vector: enough to tie the vector
/// back to the window that produced it and to the traffic it summarizes,
/// without holding any record references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureContext {
    pub vector_id: String,
    pub window_key: String,
    pub window_kind: WindowKind,
    pub window_start_unix_ms: i64,
    pub window_end_unix_ms: i64,
    pub record_count: u64,
    /// Source address of the window key (all projections key on source).
    pub key_addr: IpAddr,
    /// Destination port component of the key, if the projection has one.
    pub key_dst_port: Option<u16>,
    /// Most frequent destination port inside the window.
    pub top_dst_port: u16,
    /// Dominant transport protocol inside the window.
    pub protocol: Protocol,
}

/// A closed window's emission: the vector plus its context blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFrame {
    pub vector: FeatureVector,
    pub context: FeatureContext,
}

impl FeatureFrame {
    /// Routing key for the features topic: one window key, one partition.
    pub fn partition_key(&self) -> Vec<u8> {
        self.context.window_key.clone().into_bytes()
    }
}

pub(crate) fn new_vector_id() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("fv_{}", &raw[..12])
}

pub(crate) fn key_display(key: &WindowKey) -> String {
    match key {
        WindowKey::SrcAddr(addr) => addr.to_string(),
        WindowKey::SrcAddrDstPort(addr, port) => format!("{}:{}", addr, port),
    }
}
