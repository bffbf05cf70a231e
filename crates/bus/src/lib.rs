//! In-process event bus: ordered, partitioned topics with at-least-once
//! delivery and bounded backpressure.
//!
//! A topic is a fixed set of partitions. Ordering holds within a partition
//! only. Consumers join a named group; deliveries not yet committed by the
//! group are re-delivered when the group re-subscribes, so downstream stages
//! must be idempotent on record ids. A full partition blocks the publisher
//! until the configured deadline elapses.

mod partition;
mod topic;

use std::fmt;

use sha2::{Digest, Sha256};

pub use topic::{Delivered, Subscription, Topic};

pub const TOPIC_NORMALIZED: &str = "normalized";
pub const TOPIC_FEATURES: &str = "features";
pub const TOPIC_ALERTS: &str = "alerts";

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub partitions: usize,
    pub partition_capacity: usize,
    pub publish_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            partitions: 4,
            partition_capacity: 1024,
            publish_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug)]
pub enum PublishError {
    Timeout { topic: String, partition: usize },
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { topic, partition } => {
                write!(f, "publish to {}/{} timed out", topic, partition)
            }
        }
    }
}

impl std::error::Error for PublishError {}

/// Stable partition assignment for a routing key. The same key always lands
/// on the same partition for a given partition count.
pub fn partition_for(key: &[u8], partitions: usize) -> usize {
    let digest = Sha256::digest(key);
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(raw) % partitions.max(1) as u64) as usize
}
