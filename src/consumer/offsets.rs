//! Transactional consumer-group offsets
//!
//! Group coordination proper lives outside this crate. What the transaction
//! path needs is narrow: `sendOffsetsToTransaction` stages offsets against a
//! producer id, and they become visible to the group only when the commit
//! marker for that transaction is written. An abort drops them.

use crate::store::TopicId;
use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tracing::debug;

/// Name of the consumer offsets topic
pub const CONSUMER_OFFSETS_TOPIC: &str = "__consumer_offsets";

/// Partition count of the consumer offsets topic
const CONSUMER_OFFSETS_PARTITIONS: i32 = 50;

/// The offsets-topic partition that holds a group's commits. The coordinator
/// registers it as a transaction participant so the commit marker reaches it.
pub fn offsets_topic_partition(group_id: &str) -> TopicId {
    let mut hasher = DefaultHasher::new();
    group_id.hash(&mut hasher);
    TopicId::new(
        CONSUMER_OFFSETS_TOPIC,
        (hasher.finish() % CONSUMER_OFFSETS_PARTITIONS as u64) as i32,
    )
}

/// An offset staged inside a transaction, not yet visible to the group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTxnOffset {
    pub group_id: String,
    pub tp: TopicId,
    pub offset: i64,
    pub metadata: Option<String>,
}

/// Committed and pending transactional offsets for consumer groups.
#[derive(Default)]
pub struct GroupOffsetStore {
    committed: DashMap<(String, TopicId), i64>,
    /// Offsets staged by transactions, keyed by producer id
    pending: DashMap<i64, Vec<PendingTxnOffset>>,
}

impl GroupOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage an offset commit inside the producer's open transaction.
    pub fn stage(&self, producer_id: i64, pending: PendingTxnOffset) {
        let mut staged = self.pending.entry(producer_id).or_default();
        // Last stage per (group, partition) wins
        staged.retain(|p| !(p.group_id == pending.group_id && p.tp == pending.tp));
        staged.push(pending);
    }

    /// Make the producer's staged offsets visible; called when the commit
    /// marker is written. Returns how many offsets were applied.
    pub fn commit_pending(&self, producer_id: i64) -> usize {
        let Some((_, staged)) = self.pending.remove(&producer_id) else {
            return 0;
        };
        let applied = staged.len();
        for p in staged {
            debug!(
                group = %p.group_id,
                partition = %p.tp,
                offset = p.offset,
                "transactional offset committed"
            );
            self.committed.insert((p.group_id, p.tp), p.offset);
        }
        applied
    }

    /// Discard the producer's staged offsets; called on abort.
    pub fn drop_pending(&self, producer_id: i64) -> usize {
        self.pending.remove(&producer_id).map(|(_, v)| v.len()).unwrap_or(0)
    }

    /// The group's committed offset for a partition, if any.
    pub fn committed(&self, group_id: &str, tp: &TopicId) -> Option<i64> {
        self.committed
            .get(&(group_id.to_string(), tp.clone()))
            .map(|o| *o)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(group: &str, partition: i32, offset: i64) -> PendingTxnOffset {
        PendingTxnOffset {
            group_id: group.to_string(),
            tp: TopicId::new("t", partition),
            offset,
            metadata: None,
        }
    }

    #[test]
    fn test_offsets_invisible_until_commit() {
        let store = GroupOffsetStore::new();
        store.stage(1000, pending("g", 0, 42));

        assert_eq!(store.committed("g", &TopicId::new("t", 0)), None);

        assert_eq!(store.commit_pending(1000), 1);
        assert_eq!(store.committed("g", &TopicId::new("t", 0)), Some(42));
    }

    #[test]
    fn test_abort_drops_staged_offsets() {
        let store = GroupOffsetStore::new();
        store.stage(1000, pending("g", 0, 42));

        assert_eq!(store.drop_pending(1000), 1);
        assert_eq!(store.commit_pending(1000), 0);
        assert_eq!(store.committed("g", &TopicId::new("t", 0)), None);
    }

    #[test]
    fn test_restage_overwrites() {
        let store = GroupOffsetStore::new();
        store.stage(1000, pending("g", 0, 10));
        store.stage(1000, pending("g", 0, 20));
        store.stage(1000, pending("g", 1, 5));

        assert_eq!(store.commit_pending(1000), 2);
        assert_eq!(store.committed("g", &TopicId::new("t", 0)), Some(20));
        assert_eq!(store.committed("g", &TopicId::new("t", 1)), Some(5));
    }

    #[test]
    fn test_offsets_partition_is_stable() {
        let a = offsets_topic_partition("group-a");
        assert_eq!(a, offsets_topic_partition("group-a"));
        assert_eq!(a.topic, CONSUMER_OFFSETS_TOPIC);
    }
}
