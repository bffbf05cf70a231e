use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tracing::debug;

use crate::partition::Partition;
use crate::{BusConfig, PublishError};

/// A message handed to a consumer. The offset must be committed back on the
/// subscription once downstream side-effects are durable; uncommitted
/// messages are re-delivered when the group re-subscribes.
#[derive(Debug, Clone)]
pub struct Delivered<T> {
    pub partition: usize,
    pub offset: u64,
    pub payload: T,
}

pub struct Topic<T> {
    name: String,
    partitions: Vec<Arc<Partition<T>>>,
    publish_timeout: Duration,
}

impl<T: Clone> Topic<T> {
    pub fn new(name: &str, config: &BusConfig) -> Self {
        let partitions = (0..config.partitions.max(1))
            .map(|_| Arc::new(Partition::new(config.partition_capacity)))
            .collect();
        Self {
            name: name.to_string(),
            partitions,
            publish_timeout: Duration::from_millis(config.publish_timeout_ms),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Append to the given partition, blocking while it is full. Fails with
    /// `PublishError::Timeout` once the configured deadline elapses; the
    /// caller decides whether to retry or drop.
    pub async fn publish(&self, partition: usize, payload: T) -> Result<u64, PublishError> {
        let index = partition % self.partitions.len();
        let part = &self.partitions[index];

        let mut pending = payload;
        let deadline = time::Instant::now() + self.publish_timeout;
        loop {
            let writable = part.writable.notified();
            match part.try_push(pending) {
                Ok(offset) => return Ok(offset),
                Err(returned) => pending = returned,
            }
            if time::timeout_at(deadline, writable).await.is_err() {
                debug!(topic = %self.name, partition = index, "publish deadline elapsed");
                return Err(PublishError::Timeout {
                    topic: self.name.clone(),
                    partition: index,
                });
            }
        }
    }

    /// Join a consumer group: one subscription per partition. Re-subscribing
    /// with the same group name rewinds each partition cursor to the last
    /// committed offset.
    pub fn subscribe(&self, group: &str) -> Vec<Subscription<T>> {
        self.partitions
            .iter()
            .enumerate()
            .map(|(index, part)| {
                part.register_group(group);
                Subscription {
                    partition_index: index,
                    group: group.to_string(),
                    partition: Arc::clone(part),
                }
            })
            .collect()
    }

    pub fn depth(&self, partition: usize) -> usize {
        self.partitions[partition % self.partitions.len()].depth()
    }
}

pub struct Subscription<T> {
    partition_index: usize,
    group: String,
    partition: Arc<Partition<T>>,
}

impl<T: Clone> Subscription<T> {
    pub fn partition(&self) -> usize {
        self.partition_index
    }

    /// Next message for this group, waiting until one is available. Callers
    /// race this against shutdown in a `select!`.
    pub async fn recv(&self) -> Delivered<T> {
        loop {
            let readable = self.partition.readable.notified();
            if let Some((offset, payload)) = self.partition.try_take(&self.group) {
                return Delivered {
                    partition: self.partition_index,
                    offset,
                    payload,
                };
            }
            readable.await;
        }
    }

    pub fn try_recv(&self) -> Option<Delivered<T>> {
        self.partition
            .try_take(&self.group)
            .map(|(offset, payload)| Delivered {
                partition: self.partition_index,
                offset,
                payload,
            })
    }

    pub fn commit(&self, offset: u64) {
        self.partition.commit(&self.group, offset);
    }

    pub fn lag(&self) -> usize {
        self.partition.lag(&self.group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> BusConfig {
        BusConfig {
            partitions: 2,
            partition_capacity: 4,
            publish_timeout_ms: 50,
        }
    }

    #[tokio::test]
    async fn delivers_in_order_within_partition() {
        let topic: Topic<u32> = Topic::new("t", &small_config());
        let subs = topic.subscribe("g");

        topic.publish(0, 10).await.expect("publish");
        topic.publish(0, 11).await.expect("publish");
        topic.publish(0, 12).await.expect("publish");

        let a = subs[0].recv().await;
        let b = subs[0].recv().await;
        let c = subs[0].recv().await;
        assert_eq!((a.payload, b.payload, c.payload), (10, 11, 12));
        assert!(a.offset < b.offset && b.offset < c.offset);
    }

    #[tokio::test]
    async fn redelivers_uncommitted_on_resubscribe() {
        let topic: Topic<u32> = Topic::new("t", &small_config());
        let subs = topic.subscribe("g");

        topic.publish(0, 1).await.expect("publish");
        topic.publish(0, 2).await.expect("publish");

        let first = subs[0].recv().await;
        subs[0].commit(first.offset);
        let second = subs[0].recv().await;
        assert_eq!(second.payload, 2);
        // Not committed: a fresh subscription of the same group sees it again.
        let subs2 = topic.subscribe("g");
        let replayed = subs2[0].recv().await;
        assert_eq!(replayed.payload, 2);
        assert_eq!(replayed.offset, second.offset);
    }

    #[tokio::test]
    async fn publish_times_out_when_full() {
        let topic: Topic<u32> = Topic::new("t", &small_config());
        let _subs = topic.subscribe("g");

        for i in 0..4 {
            topic.publish(0, i).await.expect("publish under capacity");
        }
        let err = topic.publish(0, 99).await;
        assert!(matches!(err, Err(PublishError::Timeout { .. })));
    }

    #[tokio::test]
    async fn commit_frees_capacity() {
        let topic: Topic<u32> = Topic::new("t", &small_config());
        let subs = topic.subscribe("g");

        for i in 0..4 {
            topic.publish(0, i).await.expect("publish");
        }
        let d = subs[0].recv().await;
        subs[0].commit(d.offset);
        topic.publish(0, 100).await.expect("capacity released");
    }

    #[tokio::test]
    async fn groups_are_independent() {
        let topic: Topic<u32> = Topic::new("t", &small_config());
        let g1 = topic.subscribe("g1");
        let g2 = topic.subscribe("g2");

        topic.publish(1, 7).await.expect("publish");
        assert_eq!(g1[1].recv().await.payload, 7);
        assert_eq!(g2[1].recv().await.payload, 7);
    }
}
