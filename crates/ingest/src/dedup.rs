use std::num::NonZeroUsize;

use lru::LruCache;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub sensor_id: String,
    pub flow_id: u64,
    pub t_end_unix_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupVerdict {
    Fresh,
    /// Fresh, but accepting it pushed the oldest key out of the window.
    FreshEvicting,
    Duplicate,
}

/// Bounded LRU window over `(sensor_id, flow_id, t_end)`. Collectors resend
/// flow frames on export retry; the window absorbs those without growing
/// past its capacity.
pub struct Deduper {
    cache: LruCache<DedupKey, ()>,
}

impl Deduper {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("nonzero dedup capacity");
        Self {
            cache: LruCache::new(capacity),
        }
    }

    pub fn observe(&mut self, key: DedupKey) -> DedupVerdict {
        if self.cache.contains(&key) {
            self.cache.promote(&key);
            return DedupVerdict::Duplicate;
        }

        match self.cache.push(key, ()) {
            Some(_) => DedupVerdict::FreshEvicting,
            None => DedupVerdict::Fresh,
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
