//! Log store seam
//!
//! The bridge runs on top of a foreign append-only log store that is not
//! aware of Kafka transactions. This module defines the trait the rest of
//! the crate programs against and an in-memory implementation used by tests
//! and embedded deployments.
//!
//! The store owns offsets: `append` assigns a dense base offset per
//! partition, trimming advances the oldest available offset, and unload /
//! reload cycles are surfaced through a watch channel so a `PartitionLog`
//! can drop out of service and re-recover.

use crate::error::{GateError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

/// A topic partition coordinate
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct TopicId {
    pub topic: String,
    pub partition: i32,
}

impl TopicId {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// A batch as stored: the opaque payload plus the offset range the store
/// assigned to it.
#[derive(Debug, Clone)]
pub struct StoredBatch {
    /// First offset of the batch
    pub base_offset: i64,
    /// Number of records in the batch
    pub record_count: i32,
    /// Encoded record batch, opaque to the store
    pub payload: Bytes,
}

impl StoredBatch {
    /// Last offset covered by this batch
    pub fn last_offset(&self) -> i64 {
        self.base_offset + i64::from(self.record_count) - 1
    }
}

/// The foreign append-only log store.
///
/// Implementations bind the bridge to the actual storage system. All methods
/// may suspend; none of them know anything about producers, epochs, or
/// transactions.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Append an encoded batch of `record_count` records, returning the base
    /// offset the store assigned.
    async fn append(&self, tp: &TopicId, payload: Bytes, record_count: i32) -> Result<i64>;

    /// Read batches covering offsets at or after `from_offset`, up to
    /// `max_batches` of them.
    async fn read(
        &self,
        tp: &TopicId,
        from_offset: i64,
        max_batches: usize,
    ) -> Result<Vec<StoredBatch>>;

    /// The next offset the store would assign (log end offset).
    async fn high_watermark(&self, tp: &TopicId) -> Result<i64>;

    /// The earliest offset still present. Moves forward when the store trims
    /// the head of the partition.
    async fn oldest_available_offset(&self, tp: &TopicId) -> Result<i64>;

    /// Stable identity of the partition. A deleted-and-recreated topic gets a
    /// fresh UUID.
    async fn topic_uuid(&self, tp: &TopicId) -> Result<Uuid>;

    /// Observe unload (true) / reload (false) notifications for a partition.
    fn subscribe_unload(&self, tp: &TopicId) -> watch::Receiver<bool>;
}

struct MemoryPartition {
    uuid: Uuid,
    batches: Vec<StoredBatch>,
    /// Next offset to assign
    log_end_offset: i64,
    /// Earliest offset still readable
    oldest_offset: i64,
    unload_tx: watch::Sender<bool>,
}

impl MemoryPartition {
    fn new() -> Self {
        let (unload_tx, _) = watch::channel(false);
        Self {
            uuid: Uuid::new_v4(),
            batches: Vec::new(),
            log_end_offset: 0,
            oldest_offset: 0,
            unload_tx,
        }
    }
}

/// In-memory `LogStore` with store-side trim and unload simulation.
///
/// Partitions are created on first touch. `trim`, `unload`, and
/// `delete_topic` are inherent methods (not part of the trait) because in a
/// real deployment those actions originate inside the store.
#[derive(Clone, Default)]
pub struct MemoryLogStore {
    partitions: Arc<RwLock<HashMap<TopicId, MemoryPartition>>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_partition<T>(&self, tp: &TopicId, f: impl FnOnce(&mut MemoryPartition) -> T) -> T {
        let mut partitions = self.partitions.write();
        let partition = partitions
            .entry(tp.clone())
            .or_insert_with(MemoryPartition::new);
        f(partition)
    }

    /// Drop everything below `before_offset`, advancing the oldest available
    /// offset. Batches are dropped whole: a batch survives while any of its
    /// offsets are at or above the trim point.
    pub fn trim(&self, tp: &TopicId, before_offset: i64) {
        self.with_partition(tp, |p| {
            p.batches.retain(|b| b.last_offset() >= before_offset);
            if before_offset > p.oldest_offset {
                p.oldest_offset = before_offset.min(p.log_end_offset);
            }
        });
    }

    /// Simulate the store unloading the partition.
    pub fn unload(&self, tp: &TopicId) {
        self.with_partition(tp, |p| {
            let _ = p.unload_tx.send(true);
        });
    }

    /// Simulate the store loading the partition back.
    pub fn reload(&self, tp: &TopicId) {
        self.with_partition(tp, |p| {
            let _ = p.unload_tx.send(false);
        });
    }

    /// Delete a topic partition entirely. A later touch re-creates it with a
    /// fresh UUID and offsets starting at zero.
    pub fn delete_topic(&self, tp: &TopicId) {
        self.partitions.write().remove(tp);
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn append(&self, tp: &TopicId, payload: Bytes, record_count: i32) -> Result<i64> {
        if record_count <= 0 {
            return Err(GateError::storage("append", "empty batch"));
        }
        Ok(self.with_partition(tp, |p| {
            let base_offset = p.log_end_offset;
            p.batches.push(StoredBatch {
                base_offset,
                record_count,
                payload,
            });
            p.log_end_offset += i64::from(record_count);
            base_offset
        }))
    }

    async fn read(
        &self,
        tp: &TopicId,
        from_offset: i64,
        max_batches: usize,
    ) -> Result<Vec<StoredBatch>> {
        self.with_partition(tp, |p| {
            if from_offset > p.log_end_offset {
                return Err(GateError::OffsetOutOfRange(from_offset));
            }
            Ok(p.batches
                .iter()
                .filter(|b| b.last_offset() >= from_offset)
                .take(max_batches)
                .cloned()
                .collect())
        })
    }

    async fn high_watermark(&self, tp: &TopicId) -> Result<i64> {
        Ok(self.with_partition(tp, |p| p.log_end_offset))
    }

    async fn oldest_available_offset(&self, tp: &TopicId) -> Result<i64> {
        Ok(self.with_partition(tp, |p| p.oldest_offset))
    }

    async fn topic_uuid(&self, tp: &TopicId) -> Result<Uuid> {
        Ok(self.with_partition(tp, |p| p.uuid))
    }

    fn subscribe_unload(&self, tp: &TopicId) -> watch::Receiver<bool> {
        self.with_partition(tp, |p| p.unload_tx.subscribe())
    }
}
