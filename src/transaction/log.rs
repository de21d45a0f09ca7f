//! Internal transaction log
//!
//! Coordinator state is persisted in a key-compacted internal topic keyed by
//! transactional id: every state change is appended before the request is
//! acknowledged, and recovery replays the log, keeping the latest value per
//! key. Transactional ids are hashed across a fixed number of shards
//! (internal log partitions); each shard is a single-writer domain.

use crate::error::{GateError, Result};
use crate::store::{LogStore, TopicId};
use crate::transaction::state::TransactionMetadata;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Name of the internal topic holding coordinator state
pub const TXN_LOG_TOPIC: &str = "__transaction_state";

/// One transaction-log record. A `None` value is a tombstone: the
/// transactional id has expired and compaction will drop it.
#[derive(Debug, Serialize, Deserialize)]
struct TxnLogEntry {
    key: String,
    value: Option<TransactionMetadata>,
}

/// Persists coordinator state and serves the materialized view of it.
pub struct TxnStateManager {
    store: Arc<dyn LogStore>,
    num_shards: i32,
    /// Shards this coordinator owns; `None` means all of them
    owned_shards: Option<Vec<i32>>,
    transactions: DashMap<String, TransactionMetadata>,
    loaded: AtomicBool,
}

impl TxnStateManager {
    pub fn new(store: Arc<dyn LogStore>, num_shards: i32) -> Self {
        Self {
            store,
            num_shards: num_shards.max(1),
            owned_shards: None,
            transactions: DashMap::new(),
            loaded: AtomicBool::new(false),
        }
    }

    /// Restrict this manager to a subset of shards. Requests for ids hashed
    /// to other shards fail with `NotCoordinator`.
    pub fn with_owned_shards(mut self, shards: Vec<i32>) -> Self {
        self.owned_shards = Some(shards);
        self
    }

    /// Shard a transactional id hashes to.
    pub fn shard_for(&self, transactional_id: &str) -> i32 {
        let mut hasher = DefaultHasher::new();
        transactional_id.hash(&mut hasher);
        (hasher.finish() % self.num_shards as u64) as i32
    }

    fn shard_topic(&self, shard: i32) -> TopicId {
        TopicId::new(TXN_LOG_TOPIC, shard)
    }

    /// Reject requests this manager cannot serve yet (or at all).
    pub fn check_ready(&self, transactional_id: &str) -> Result<()> {
        let shard = self.shard_for(transactional_id);
        if let Some(owned) = &self.owned_shards {
            if !owned.contains(&shard) {
                return Err(GateError::NotCoordinator(transactional_id.to_string()));
            }
        }
        if !self.loaded.load(Ordering::Acquire) {
            return Err(GateError::CoordinatorLoadInProgress(shard));
        }
        Ok(())
    }

    /// Replay the owned shards of the transaction log, materializing the
    /// latest metadata per transactional id.
    pub async fn load(&self) -> Result<()> {
        let shards: Vec<i32> = match &self.owned_shards {
            Some(owned) => owned.clone(),
            None => (0..self.num_shards).collect(),
        };

        let mut restored = 0usize;
        for shard in shards {
            let tp = self.shard_topic(shard);
            let start = self.store.oldest_available_offset(&tp).await?;
            let batches = self.store.read(&tp, start, usize::MAX).await?;
            for stored in batches {
                match serde_json::from_slice::<TxnLogEntry>(&stored.payload) {
                    Ok(TxnLogEntry {
                        key,
                        value: Some(meta),
                    }) => {
                        self.transactions.insert(key, meta);
                        restored += 1;
                    }
                    Ok(TxnLogEntry { key, value: None }) => {
                        self.transactions.remove(&key);
                    }
                    Err(e) => {
                        warn!(
                            shard,
                            offset = stored.base_offset,
                            error = %e,
                            "skipping corrupted transaction log entry"
                        );
                    }
                }
            }
        }

        self.loaded.store(true, Ordering::Release);
        info!(
            transactions = self.transactions.len(),
            entries = restored,
            "transaction log loaded"
        );
        Ok(())
    }

    /// Persist a state change, then update the materialized view.
    ///
    /// The append happens before the view changes so a change is never
    /// acknowledged without being durable.
    pub async fn put(&self, meta: TransactionMetadata) -> Result<()> {
        let entry = TxnLogEntry {
            key: meta.transactional_id.clone(),
            value: Some(meta.clone()),
        };
        let payload = Bytes::from(serde_json::to_vec(&entry)?);
        let tp = self.shard_topic(self.shard_for(&meta.transactional_id));
        self.store.append(&tp, payload, 1).await?;
        self.transactions.insert(meta.transactional_id.clone(), meta);
        Ok(())
    }

    /// Tombstone an expired transactional id.
    pub async fn tombstone(&self, transactional_id: &str) -> Result<()> {
        let entry = TxnLogEntry {
            key: transactional_id.to_string(),
            value: None,
        };
        let payload = Bytes::from(serde_json::to_vec(&entry)?);
        let tp = self.shard_topic(self.shard_for(transactional_id));
        self.store.append(&tp, payload, 1).await?;
        self.transactions.remove(transactional_id);
        Ok(())
    }

    pub fn get(&self, transactional_id: &str) -> Option<TransactionMetadata> {
        self.transactions.get(transactional_id).map(|m| m.clone())
    }

    /// Largest producer id recorded in the log, for allocator recovery.
    pub fn max_producer_id(&self) -> Option<i64> {
        self.transactions.iter().map(|m| m.producer_id).max()
    }

    /// Snapshot of all tracked transactions.
    pub fn all(&self) -> Vec<TransactionMetadata> {
        self.transactions.iter().map(|m| m.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryLogStore;
    use crate::transaction::state::TxnState;

    fn meta(id: &str, pid: i64) -> TransactionMetadata {
        TransactionMetadata::new(id.to_string(), pid, 60_000, 0)
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let mgr = TxnStateManager::new(Arc::new(MemoryLogStore::new()), 4);
        mgr.load().await.unwrap();

        mgr.put(meta("txn-1", 1000)).await.unwrap();
        let restored = mgr.get("txn-1").unwrap();
        assert_eq!(restored.producer_id, 1000);
        assert_eq!(restored.state, TxnState::Empty);
    }

    #[tokio::test]
    async fn test_not_loaded_rejects_requests() {
        let mgr = TxnStateManager::new(Arc::new(MemoryLogStore::new()), 4);
        let err = mgr.check_ready("txn-1").unwrap_err();
        assert!(matches!(err, GateError::CoordinatorLoadInProgress(_)));

        mgr.load().await.unwrap();
        assert!(mgr.check_ready("txn-1").is_ok());
    }

    #[tokio::test]
    async fn test_unowned_shard_is_not_coordinator() {
        let mgr =
            TxnStateManager::new(Arc::new(MemoryLogStore::new()), 4).with_owned_shards(vec![]);
        mgr.load().await.unwrap();

        let err = mgr.check_ready("txn-1").unwrap_err();
        assert!(matches!(err, GateError::NotCoordinator(_)));
    }

    #[tokio::test]
    async fn test_replay_keeps_latest_per_key() {
        let store = Arc::new(MemoryLogStore::new());
        {
            let mgr = TxnStateManager::new(store.clone(), 4);
            mgr.load().await.unwrap();

            let mut m = meta("txn-1", 1000);
            mgr.put(m.clone()).await.unwrap();
            m.bump_epoch(1);
            mgr.put(m.clone()).await.unwrap();
            mgr.put(meta("txn-2", 1001)).await.unwrap();
            mgr.tombstone("txn-2").await.unwrap();
        }

        let mgr = TxnStateManager::new(store, 4);
        mgr.load().await.unwrap();

        assert_eq!(mgr.len(), 1);
        let restored = mgr.get("txn-1").unwrap();
        assert_eq!(restored.producer_epoch, 1);
        assert!(mgr.get("txn-2").is_none());
    }

    #[tokio::test]
    async fn test_max_producer_id() {
        let mgr = TxnStateManager::new(Arc::new(MemoryLogStore::new()), 4);
        mgr.load().await.unwrap();
        assert_eq!(mgr.max_producer_id(), None);

        mgr.put(meta("a", 1000)).await.unwrap();
        mgr.put(meta("b", 1207)).await.unwrap();
        assert_eq!(mgr.max_producer_id(), Some(1207));
    }

    #[test]
    fn test_sharding_is_stable() {
        let mgr = TxnStateManager::new(Arc::new(MemoryLogStore::new()), 8);
        let shard = mgr.shard_for("some-id");
        assert_eq!(shard, mgr.shard_for("some-id"));
        assert!((0..8).contains(&shard));
    }
}
