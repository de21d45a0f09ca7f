//! Partition registry
//!
//! Hands out the `PartitionLog` binding for a topic partition, creating and
//! recovering it on first touch and re-creating it after the store unloads
//! it. The registry is also the marker-writing seam the coordinator uses, so
//! the coordinator and the partitions never hold references to each other.

use crate::config::GateConfig;
use crate::error::Result;
use crate::partition::log::PartitionLog;
use crate::partition::snapshot::SnapshotBuffer;
use crate::protocol::records::ControlType;
use crate::store::{LogStore, TopicId};
use crate::transaction::coordinator::MarkerWriter;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

/// Creates, caches, and recovers partition bindings.
pub struct PartitionRegistry {
    store: Arc<dyn LogStore>,
    snapshots: Arc<SnapshotBuffer>,
    config: GateConfig,
    partitions: DashMap<TopicId, Arc<PartitionLog>>,
}

impl PartitionRegistry {
    pub fn new(
        store: Arc<dyn LogStore>,
        snapshots: Arc<SnapshotBuffer>,
        config: GateConfig,
    ) -> Self {
        Self {
            store,
            snapshots,
            config,
            partitions: DashMap::new(),
        }
    }

    /// The binding for a partition, recovered and ready.
    ///
    /// An unloaded binding is dropped and a fresh one recovers from the
    /// store, picking up whatever snapshot is still valid.
    pub async fn partition(&self, tp: &TopicId) -> Result<Arc<PartitionLog>> {
        if let Some(existing) = self.partitions.get(tp) {
            if existing.is_unloaded() {
                drop(existing);
                if let Some((_, old)) = self.partitions.remove(tp) {
                    old.shutdown();
                    info!(partition = %tp, "re-creating binding for unloaded partition");
                }
            } else {
                let log = existing.clone();
                drop(existing);
                log.initialise().await?;
                return Ok(log);
            }
        }

        let log = self
            .partitions
            .entry(tp.clone())
            .or_insert_with(|| {
                let log = PartitionLog::new(
                    tp.clone(),
                    self.store.clone(),
                    self.snapshots.clone(),
                    self.config.clone(),
                );
                log.start_background_tasks();
                log
            })
            .clone();
        log.initialise().await?;
        Ok(log)
    }

    /// Stop background tasks on every binding.
    pub fn shutdown(&self) {
        for entry in self.partitions.iter() {
            entry.value().shutdown();
        }
    }
}

#[async_trait]
impl MarkerWriter for PartitionRegistry {
    async fn write_marker(
        &self,
        tp: &TopicId,
        producer_id: i64,
        producer_epoch: i16,
        control_type: ControlType,
        coordinator_epoch: i32,
    ) -> Result<i64> {
        let partition = self.partition(tp).await?;
        partition
            .complete_txn(producer_id, producer_epoch, control_type, coordinator_epoch)
            .await
    }
}
