use std::net::IpAddr;
use std::num::NonZeroUsize;

use lru::LruCache;
use policy_agent::ActionFamily;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Time bucket width; alerts for the same key inside one bucket
    /// collapse into the first.
    pub window_secs: u64,
    pub capacity: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_secs: 300,
            capacity: 8_192,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupKey {
    src_addr: IpAddr,
    family: ActionFamily,
    bucket: i64,
}

/// Suppresses repeats of `(source, action family)` within a time bucket.
pub struct AlertDeduper {
    config: DedupConfig,
    seen: LruCache<DedupKey, ()>,
}

impl AlertDeduper {
    pub fn new(config: DedupConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity.max(1)).expect("nonzero dedup capacity");
        Self {
            config,
            seen: LruCache::new(capacity),
        }
    }

    /// True when this alert is the first of its key in the current bucket.
    pub fn observe(&mut self, src_addr: IpAddr, family: ActionFamily, now_unix: i64) -> bool {
        let bucket = now_unix.div_euclid(self.config.window_secs.max(1) as i64);
        let key = DedupKey {
            src_addr,
            family,
            bucket,
        };
        if self.seen.contains(&key) {
            return false;
        }
        self.seen.push(key, ());
        true
    }
}
