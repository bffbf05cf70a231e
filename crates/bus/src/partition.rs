use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::sync::Notify;

pub(crate) struct Partition<T> {
    state: Mutex<PartitionState<T>>,
    capacity: usize,
    pub(crate) readable: Notify,
    pub(crate) writable: Notify,
}

struct PartitionState<T> {
    /// Retained entries, oldest first. An entry stays until every consumer
    /// group has committed past it.
    entries: VecDeque<(u64, T)>,
    next_offset: u64,
    /// Per-group highest committed offset (exclusive: committed means
    /// "offsets < this are done").
    committed: HashMap<String, u64>,
    /// Per-group next offset to hand out. Reset to the committed offset when
    /// the group re-subscribes, which re-delivers everything uncommitted.
    cursor: HashMap<String, u64>,
}

impl<T: Clone> Partition<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(PartitionState {
                entries: VecDeque::new(),
                next_offset: 0,
                committed: HashMap::new(),
                cursor: HashMap::new(),
            }),
            capacity: capacity.max(1),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    /// Push unless the partition is at capacity. Returns the payload on
    /// refusal so the caller can retry without cloning.
    pub(crate) fn try_push(&self, payload: T) -> Result<u64, T> {
        let mut state = self.state.lock().expect("partition lock");
        if state.entries.len() >= self.capacity {
            return Err(payload);
        }
        let offset = state.next_offset;
        state.next_offset += 1;
        state.entries.push_back((offset, payload));
        drop(state);
        self.readable.notify_waiters();
        Ok(offset)
    }

    pub(crate) fn register_group(&self, group: &str) {
        let mut state = self.state.lock().expect("partition lock");
        // A group starts committed at zero so retention holds everything
        // it has not yet acknowledged.
        let committed = *state.committed.entry(group.to_string()).or_insert(0);
        state.cursor.insert(group.to_string(), committed);
    }

    pub(crate) fn try_take(&self, group: &str) -> Option<(u64, T)> {
        let mut state = self.state.lock().expect("partition lock");
        let cursor = state.cursor.get(group).copied().unwrap_or(0);
        let found = state
            .entries
            .iter()
            .find(|(offset, _)| *offset >= cursor)
            .map(|(offset, payload)| (*offset, payload.clone()));
        if let Some((offset, _)) = found {
            state.cursor.insert(group.to_string(), offset + 1);
        }
        found
    }

    pub(crate) fn commit(&self, group: &str, offset: u64) {
        let mut state = self.state.lock().expect("partition lock");
        let entry = state.committed.entry(group.to_string()).or_insert(0);
        if offset + 1 > *entry {
            *entry = offset + 1;
        }

        // Entries are released once every known group is past them.
        let low_water = state.committed.values().copied().min().unwrap_or(0);
        let before = state.entries.len();
        while let Some((front_offset, _)) = state.entries.front() {
            if *front_offset < low_water {
                state.entries.pop_front();
            } else {
                break;
            }
        }
        let released = before - state.entries.len();
        drop(state);
        if released > 0 {
            self.writable.notify_waiters();
        }
    }

    pub(crate) fn lag(&self, group: &str) -> usize {
        let state = self.state.lock().expect("partition lock");
        let cursor = state.cursor.get(group).copied().unwrap_or(0);
        state
            .entries
            .iter()
            .filter(|(offset, _)| *offset >= cursor)
            .count()
    }

    pub(crate) fn depth(&self) -> usize {
        self.state.lock().expect("partition lock").entries.len()
    }
}
