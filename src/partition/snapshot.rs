//! Producer state snapshots and the snapshot buffer
//!
//! A snapshot is an offset-tagged image of a partition's producer state,
//! taken to bound recovery time: on reload, a partition installs the latest
//! snapshot and replays only the log suffix past it.
//!
//! The buffer is a key-compacted internal topic keyed by data partition.
//! Publishing appends; compaction means only the latest entry per key
//! matters, and an in-memory index keeps that read O(1).

use crate::error::{GateError, Result};
use crate::partition::producer_state::{AbortedTxn, OngoingTxn, ProducerId, ProducerStateEntry};
use crate::store::{LogStore, TopicId};
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Name of the internal topic holding producer state snapshots
pub const PRODUCER_SNAPSHOT_TOPIC: &str = "__transaction_producer_state";

/// Offset-tagged image of a partition's producer state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducerStateSnapshot {
    /// Schema version; bumped on incompatible change
    pub version: i32,
    /// Identity of the partition the snapshot was taken from
    pub topic_uuid: Uuid,
    /// Last offset included in the snapshot
    pub offset: i64,
    pub producers: HashMap<ProducerId, ProducerStateEntry>,
    pub ongoing_txns: BTreeMap<i64, OngoingTxn>,
    pub aborted_txns: Vec<AbortedTxn>,
}

impl ProducerStateSnapshot {
    pub const CURRENT_VERSION: i32 = 1;

    /// Serialize to the opaque blob stored in the buffer topic.
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decode a blob, rejecting unknown schema versions.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let snapshot: ProducerStateSnapshot = serde_json::from_slice(data)
            .map_err(|e| GateError::CorruptedSnapshot(e.to_string()))?;
        if snapshot.version != Self::CURRENT_VERSION {
            return Err(GateError::CorruptedSnapshot(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        Ok(snapshot)
    }
}

/// One buffer-topic entry: the data partition key plus its snapshot
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEntry {
    key: TopicId,
    value: ProducerStateSnapshot,
}

/// Latest-snapshot-per-partition store over the internal compacted topic.
pub struct SnapshotBuffer {
    store: Arc<dyn LogStore>,
    num_partitions: i32,
    /// Latest published snapshot per data partition
    latest: DashMap<TopicId, ProducerStateSnapshot>,
    /// Buffer partitions already warmed from the topic
    warmed: DashMap<i32, ()>,
}

impl SnapshotBuffer {
    pub fn new(store: Arc<dyn LogStore>, num_partitions: i32) -> Self {
        Self {
            store,
            num_partitions: num_partitions.max(1),
            latest: DashMap::new(),
            warmed: DashMap::new(),
        }
    }

    fn buffer_partition(&self, tp: &TopicId) -> TopicId {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        tp.hash(&mut hasher);
        let partition = (hasher.finish() % self.num_partitions as u64) as i32;
        TopicId::new(PRODUCER_SNAPSHOT_TOPIC, partition)
    }

    /// Publish a snapshot, superseding any prior one for the same partition.
    pub async fn publish(&self, tp: &TopicId, snapshot: ProducerStateSnapshot) -> Result<()> {
        let entry = SnapshotEntry {
            key: tp.clone(),
            value: snapshot.clone(),
        };
        let payload = Bytes::from(serde_json::to_vec(&entry)?);
        let buffer_tp = self.buffer_partition(tp);
        self.store.append(&buffer_tp, payload, 1).await?;
        debug!(partition = %tp, offset = snapshot.offset, "producer state snapshot published");
        self.latest.insert(tp.clone(), snapshot);
        Ok(())
    }

    /// Read the latest snapshot for a partition, if one exists.
    pub async fn read_latest(&self, tp: &TopicId) -> Result<Option<ProducerStateSnapshot>> {
        if let Some(snapshot) = self.latest.get(tp) {
            return Ok(Some(snapshot.clone()));
        }
        let buffer_tp = self.buffer_partition(tp);
        if self.warmed.contains_key(&buffer_tp.partition) {
            return Ok(None);
        }
        self.warm(&buffer_tp).await?;
        Ok(self.latest.get(tp).map(|s| s.clone()))
    }

    /// Replay one buffer partition, materializing the latest entry per key.
    /// Compaction keeps the topic short, so a full scan is cheap.
    async fn warm(&self, buffer_tp: &TopicId) -> Result<()> {
        let start = self.store.oldest_available_offset(buffer_tp).await?;
        let batches = self.store.read(buffer_tp, start, usize::MAX).await?;
        for stored in batches {
            match serde_json::from_slice::<SnapshotEntry>(&stored.payload) {
                Ok(entry) => {
                    // Later offsets win: only replace when newer
                    let replace = self
                        .latest
                        .get(&entry.key)
                        .map(|s| entry.value.offset >= s.offset)
                        .unwrap_or(true);
                    if replace {
                        self.latest.insert(entry.key, entry.value);
                    }
                }
                Err(e) => {
                    warn!(
                        partition = %buffer_tp,
                        offset = stored.base_offset,
                        error = %e,
                        "skipping corrupted snapshot entry"
                    );
                }
            }
        }
        self.warmed.insert(buffer_tp.partition, ());
        Ok(())
    }
}
