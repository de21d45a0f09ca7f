//! Partition log binding
//!
//! A `PartitionLog` binds one logical Kafka partition to the underlying log
//! store. It owns the partition's producer state, drives recovery after
//! (re)load, validates appends, attaches aborted-transaction metadata to
//! read-committed fetches, and runs the snapshot and purge cadences.
//!
//! # Concurrency
//!
//! The partition is a single-writer domain: every mutation (append, marker,
//! recovery, purge) runs under one `tokio::sync::Mutex`. That also closes the
//! race between purge and concurrent reads at the purge boundary, so the
//! last stable offset a fetch observes never tears.

use crate::config::GateConfig;
use crate::error::{GateError, Result};
use crate::partition::producer_state::{
    AbortedTxn, ProducerEpoch, ProducerId, ProducerStateEntry, ProducerStateManager, SequenceCheck,
};
use crate::partition::snapshot::SnapshotBuffer;
use crate::protocol::records::{self, ControlType};
use crate::store::{LogStore, StoredBatch, TopicId};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::interval;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle of a partition binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    Uninitialised,
    Recovering,
    Ready,
    Unloaded,
}

impl std::fmt::Display for PartitionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PartitionState::Uninitialised => "Uninitialised",
            PartitionState::Recovering => "Recovering",
            PartitionState::Ready => "Ready",
            PartitionState::Unloaded => "Unloaded",
        };
        f.write_str(name)
    }
}

/// Kafka fetch isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
}

impl IsolationLevel {
    pub fn from_i8(raw: i8) -> Self {
        if raw == 1 {
            IsolationLevel::ReadCommitted
        } else {
            IsolationLevel::ReadUncommitted
        }
    }
}

/// Offsets assigned to an accepted append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
    pub base_offset: i64,
    pub last_offset: i64,
}

/// A fetch response at the partition level
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub batches: Vec<StoredBatch>,
    pub high_watermark: i64,
    pub last_stable_offset: i64,
    pub log_start_offset: i64,
    /// Populated only for read-committed fetches
    pub aborted_txns: Vec<AbortedTxn>,
}

struct Inner {
    state: PartitionState,
    ppsm: ProducerStateManager,
    topic_uuid: Uuid,
    /// Monotone floor for the last stable offset
    lso_floor: i64,
    /// Aborted entries below this are eligible for purge
    purge_threshold: i64,
}

impl Inner {
    fn ensure_ready(&self, tp: &TopicId) -> Result<()> {
        if self.state != PartitionState::Ready {
            return Err(GateError::PartitionUnavailable {
                topic: tp.topic.clone(),
                partition: tp.partition,
                state: self.state.to_string(),
            });
        }
        Ok(())
    }

    /// Last stable offset given the current high watermark. Never decreases.
    fn stable_offset(&mut self, high_watermark: i64) -> i64 {
        let candidate = self
            .ppsm
            .first_unstable_offset()
            .unwrap_or(high_watermark)
            .min(high_watermark);
        if candidate > self.lso_floor {
            self.lso_floor = candidate;
        }
        self.lso_floor
    }
}

/// Binds a logical Kafka partition to the underlying log store.
pub struct PartitionLog {
    tp: TopicId,
    store: Arc<dyn LogStore>,
    snapshots: Arc<SnapshotBuffer>,
    config: GateConfig,
    inner: Mutex<Inner>,
    init_tx: watch::Sender<bool>,
    unloaded: AtomicBool,
    shutdown: Arc<AtomicBool>,
}

impl PartitionLog {
    pub fn new(
        tp: TopicId,
        store: Arc<dyn LogStore>,
        snapshots: Arc<SnapshotBuffer>,
        config: GateConfig,
    ) -> Arc<Self> {
        let (init_tx, _) = watch::channel(false);
        let ppsm = ProducerStateManager::new(&config);
        let log = Arc::new(Self {
            tp,
            store,
            snapshots,
            config,
            inner: Mutex::new(Inner {
                state: PartitionState::Uninitialised,
                ppsm,
                topic_uuid: Uuid::nil(),
                lso_floor: 0,
                purge_threshold: 0,
            }),
            init_tx,
            unloaded: AtomicBool::new(false),
            shutdown: Arc::new(AtomicBool::new(false)),
        });
        log.spawn_unload_watcher();
        log
    }

    pub fn topic_partition(&self) -> &TopicId {
        &self.tp
    }

    /// Recover producer state from the latest snapshot plus log replay.
    ///
    /// Idempotent: running it again on a `Ready` partition is a no-op, and a
    /// repeated full recovery rebuilds identical state.
    pub async fn initialise(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state == PartitionState::Ready {
            return Ok(());
        }
        inner.state = PartitionState::Recovering;

        let uuid = self.store.topic_uuid(&self.tp).await?;
        let oldest = self.store.oldest_available_offset(&self.tp).await?;
        let high_watermark = self.store.high_watermark(&self.tp).await?;

        let mut ppsm = ProducerStateManager::new(&self.config);
        ppsm.set_recovery_point(oldest);

        match self.snapshots.read_latest(&self.tp).await? {
            Some(snapshot)
                if snapshot.topic_uuid == uuid
                    && snapshot.offset >= oldest - 1
                    && snapshot.offset < high_watermark =>
            {
                debug!(
                    partition = %self.tp,
                    snapshot_offset = snapshot.offset,
                    "installing producer state snapshot"
                );
                ppsm.load_from_snapshot(snapshot);
            }
            Some(snapshot) => {
                warn!(
                    partition = %self.tp,
                    snapshot_offset = snapshot.offset,
                    snapshot_uuid = %snapshot.topic_uuid,
                    topic_uuid = %uuid,
                    oldest,
                    high_watermark,
                    "discarding invalid snapshot, recovering from log"
                );
            }
            None => {}
        }

        let replay_from = ppsm.recovery_point();
        if replay_from < high_watermark {
            let batches = self.store.read(&self.tp, replay_from, usize::MAX).await?;
            for stored in &batches {
                if stored.base_offset < replay_from {
                    continue;
                }
                self.apply_stored_batch(&mut ppsm, stored);
            }
        }

        inner.ppsm = ppsm;
        inner.topic_uuid = uuid;
        inner.purge_threshold = oldest;
        inner.lso_floor = 0;
        inner.stable_offset(high_watermark);
        inner.state = PartitionState::Ready;
        let _ = self.init_tx.send(true);

        info!(
            partition = %self.tp,
            high_watermark,
            replay_from,
            "partition recovered"
        );
        Ok(())
    }

    fn apply_stored_batch(&self, ppsm: &mut ProducerStateManager, stored: &StoredBatch) {
        let info = match records::parse_batch_info(&stored.payload) {
            Ok(info) => info,
            Err(e) => {
                warn!(
                    partition = %self.tp,
                    offset = stored.base_offset,
                    error = %e,
                    "skipping unreadable batch during recovery"
                );
                return;
            }
        };
        if info.is_control {
            match records::decode_control_batch(&stored.payload) {
                Ok(marker) => {
                    if let Err(e) = ppsm.complete_txn(
                        marker.producer_id,
                        marker.producer_epoch,
                        marker.control_type,
                        stored.base_offset,
                        marker.coordinator_epoch,
                    ) {
                        warn!(
                            partition = %self.tp,
                            offset = stored.base_offset,
                            error = %e,
                            "marker rejected during recovery"
                        );
                    }
                }
                Err(e) => {
                    warn!(
                        partition = %self.tp,
                        offset = stored.base_offset,
                        error = %e,
                        "skipping unreadable marker during recovery"
                    );
                }
            }
        } else {
            ppsm.apply_replay_batch(&info, stored.base_offset);
        }
    }

    /// Resolve once recovery has completed.
    pub async fn await_initialisation(&self) {
        let mut rx = self.init_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Validate a data batch against producer state and append it.
    pub async fn append(&self, payload: Bytes) -> Result<AppendResult> {
        let mut inner = self.inner.lock().await;
        inner.ensure_ready(&self.tp)?;

        let info = records::parse_batch_info(&payload)?;
        if info.is_control {
            return Err(GateError::InvalidTxnState(
                "control batches are written by the coordinator, not produced".to_string(),
            ));
        }

        match inner.ppsm.validate_append(&info) {
            SequenceCheck::Ok => {}
            SequenceCheck::Duplicate {
                base_offset,
                last_offset,
            } => {
                return Err(GateError::DuplicateSequenceNumber {
                    base_offset,
                    last_offset,
                })
            }
            SequenceCheck::OutOfOrder { expected, received } => {
                return Err(GateError::OutOfOrderSequenceNumber { expected, received })
            }
            SequenceCheck::Fenced { current, received } => {
                return Err(GateError::InvalidProducerEpoch { current, received })
            }
        }

        let base_offset = self
            .store
            .append(&self.tp, payload, info.record_count)
            .await?;
        inner.ppsm.update_append(&info, base_offset);

        let high_watermark = self.store.high_watermark(&self.tp).await?;
        inner.stable_offset(high_watermark);

        Ok(AppendResult {
            base_offset,
            last_offset: base_offset + i64::from(info.record_count) - 1,
        })
    }

    /// Write a transaction marker and close the producer's open transaction.
    ///
    /// Returns the marker's offset. Safe to retry: the producer state
    /// application is idempotent.
    pub async fn complete_txn(
        &self,
        producer_id: ProducerId,
        producer_epoch: ProducerEpoch,
        control_type: ControlType,
        coordinator_epoch: i32,
    ) -> Result<i64> {
        let mut inner = self.inner.lock().await;
        inner.ensure_ready(&self.tp)?;

        let high_watermark = self.store.high_watermark(&self.tp).await?;
        let payload = records::encode_control_batch(
            high_watermark,
            producer_id,
            producer_epoch,
            control_type,
            coordinator_epoch,
        );
        let marker_offset = self.store.append(&self.tp, payload, 1).await?;

        inner.ppsm.complete_txn(
            producer_id,
            producer_epoch,
            control_type,
            marker_offset,
            coordinator_epoch,
        )?;

        let high_watermark = self.store.high_watermark(&self.tp).await?;
        inner.stable_offset(high_watermark);
        Ok(marker_offset)
    }

    /// Fetch batches from `offset`, honoring the isolation level.
    pub async fn fetch(
        &self,
        offset: i64,
        max_batches: usize,
        isolation: IsolationLevel,
    ) -> Result<FetchResult> {
        let mut inner = self.inner.lock().await;
        inner.ensure_ready(&self.tp)?;

        let high_watermark = self.store.high_watermark(&self.tp).await?;
        let last_stable_offset = inner.stable_offset(high_watermark);
        let log_start_offset = self.store.oldest_available_offset(&self.tp).await?;

        let upper = match isolation {
            IsolationLevel::ReadCommitted => last_stable_offset,
            IsolationLevel::ReadUncommitted => high_watermark,
        };

        let batches = if offset >= upper {
            Vec::new()
        } else {
            self.store
                .read(&self.tp, offset, max_batches)
                .await?
                .into_iter()
                .filter(|b| b.base_offset < upper)
                .collect()
        };

        let aborted_txns = match isolation {
            IsolationLevel::ReadCommitted if upper > offset => {
                inner.ppsm.aborted_txns_overlapping(offset, upper - 1)
            }
            _ => Vec::new(),
        };

        Ok(FetchResult {
            batches,
            high_watermark,
            last_stable_offset,
            log_start_offset,
            aborted_txns,
        })
    }

    /// Serialize the producer state at the current applied boundary and
    /// publish it to the snapshot buffer.
    ///
    /// Returns the snapshot offset. Publication is off the append path; a
    /// failed publish only delays the next recovery, it never loses data.
    pub async fn take_producer_snapshot(&self) -> Result<i64> {
        let snapshot = {
            let inner = self.inner.lock().await;
            inner.ensure_ready(&self.tp)?;
            let high_watermark = self.store.high_watermark(&self.tp).await?;
            inner.ppsm.snapshot(inner.topic_uuid, high_watermark - 1)
        };
        let offset = snapshot.offset;
        self.snapshots.publish(&self.tp, snapshot).await?;
        Ok(offset)
    }

    /// Earliest offset still present in the store; advances after trim.
    pub async fn fetch_oldest_available_offset(&self) -> Result<i64> {
        self.store.oldest_available_offset(&self.tp).await
    }

    /// Recompute the purge threshold from the store's trim point.
    pub async fn update_purge_aborted_txns_offset(&self) -> Result<i64> {
        let oldest = self.store.oldest_available_offset(&self.tp).await?;
        let mut inner = self.inner.lock().await;
        inner.purge_threshold = oldest;
        Ok(oldest)
    }

    /// Purge aborted-transaction entries whose data the store has trimmed.
    /// Returns the number of entries removed.
    pub async fn force_purge_abort_tx(&self) -> Result<usize> {
        let oldest = self.store.oldest_available_offset(&self.tp).await?;
        let mut inner = self.inner.lock().await;
        inner.ensure_ready(&self.tp)?;
        if oldest > inner.purge_threshold {
            inner.purge_threshold = oldest;
        }
        let threshold = inner.purge_threshold;
        let purged = inner.ppsm.purge_aborted_before(threshold);
        if purged > 0 {
            info!(partition = %self.tp, purged, threshold, "purged aborted transactions");
        }
        Ok(purged)
    }

    /// True once the store has notified that this partition was unloaded.
    pub fn is_unloaded(&self) -> bool {
        self.unloaded.load(Ordering::Acquire)
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> PartitionState {
        self.inner.lock().await.state
    }

    /// Aborted-transaction first offsets, oldest first. Test observability.
    pub async fn aborted_first_offsets(&self) -> Vec<i64> {
        self.inner.lock().await.ppsm.aborted_first_offsets()
    }

    /// Snapshot of the tracked producer entries, for the admin plane.
    pub async fn producer_entries(&self) -> Vec<ProducerStateEntry> {
        self.inner
            .lock()
            .await
            .ppsm
            .producers()
            .cloned()
            .collect()
    }

    fn spawn_unload_watcher(self: &Arc<Self>) {
        let log = Arc::clone(self);
        let mut rx = self.store.subscribe_unload(&self.tp);
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                if log.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                if *rx.borrow() {
                    log.unloaded.store(true, Ordering::Release);
                    let mut inner = log.inner.lock().await;
                    inner.state = PartitionState::Unloaded;
                    let _ = log.init_tx.send(false);
                    info!(partition = %log.tp, "partition unloaded");
                }
            }
        });
    }

    /// Start the periodic snapshot and purge tasks. An interval of zero
    /// disables the corresponding task.
    pub fn start_background_tasks(self: &Arc<Self>) {
        if self.config.producer_state_snapshot_interval_secs > 0 {
            let log = Arc::clone(self);
            tokio::spawn(async move {
                let mut tick =
                    interval(Duration::from_secs(log.config.producer_state_snapshot_interval_secs));
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tick.tick().await;
                    if log.shutdown.load(Ordering::Relaxed) || log.is_unloaded() {
                        break;
                    }
                    if let Err(e) = log.take_producer_snapshot().await {
                        warn!(partition = %log.tp, error = %e, "periodic snapshot failed");
                    }
                }
            });
        }

        if self.config.purge_aborted_txn_interval_secs > 0 {
            let log = Arc::clone(self);
            tokio::spawn(async move {
                let mut tick =
                    interval(Duration::from_secs(log.config.purge_aborted_txn_interval_secs));
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tick.tick().await;
                    if log.shutdown.load(Ordering::Relaxed) || log.is_unloaded() {
                        break;
                    }
                    if let Err(e) = log.force_purge_abort_tx().await {
                        warn!(partition = %log.tp, error = %e, "periodic purge failed");
                    }
                    let now = chrono::Utc::now().timestamp_millis();
                    let mut inner = log.inner.lock().await;
                    inner.ppsm.evict_expired(now);
                }
            });
        }
    }

    /// Stop background tasks.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}
