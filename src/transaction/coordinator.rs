//! Transaction coordinator
//!
//! The coordinator owns the per-transactional-id state machines: it assigns
//! producer ids and epochs, fences zombie producers, orchestrates two-phase
//! commit by writing markers to the participant partitions, and persists
//! every state change to the internal transaction log before acknowledging
//! it.
//!
//! # Concurrency
//!
//! Transactional ids are sharded by hash across the internal log partitions;
//! the materialized view is a `DashMap`, so operations on different ids never
//! contend. Marker writes go out to participants concurrently and are
//! retried until they land: once a `Prepare*` state is persisted, completion
//! is uncancellable.

use crate::config::GateConfig;
use crate::consumer::offsets::{offsets_topic_partition, GroupOffsetStore, PendingTxnOffset};
use crate::error::{GateError, Result};
use crate::protocol::records::ControlType;
use crate::store::TopicId;
use crate::transaction::log::TxnStateManager;
use crate::transaction::state::{TransactionMetadata, TxnState};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// First producer id handed out, leaving room below for reserved ids
const FIRST_PRODUCER_ID: i64 = 1000;

/// Initial backoff between marker write retries (doubles up to the cap)
const MARKER_RETRY_INITIAL_BACKOFF_MS: u64 = 100;

/// Cap on the marker retry backoff
const MARKER_RETRY_MAX_BACKOFF_MS: u64 = 10_000;

/// Interval of the timeout / expiration sweeper
const SWEEP_INTERVAL_MS: u64 = 10_000;

/// Writes transaction markers to data partitions.
///
/// The coordinator and the partitions are separate single-writer domains;
/// this trait is the message-passing seam between them, so neither side
/// holds a reference cycle on the other.
#[async_trait]
pub trait MarkerWriter: Send + Sync {
    /// Append a control batch to the partition and apply it to producer
    /// state. Returns the marker offset. Must be idempotent.
    async fn write_marker(
        &self,
        tp: &TopicId,
        producer_id: i64,
        producer_epoch: i16,
        control_type: ControlType,
        coordinator_epoch: i32,
    ) -> Result<i64>;
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A marker rejected for epoch reasons will never succeed; a newer owner has
/// taken over and its own markers supersede ours.
fn marker_write_is_final(e: &GateError) -> bool {
    matches!(
        e,
        GateError::InvalidProducerEpoch { .. }
            | GateError::TransactionCoordinatorFenced { .. }
            | GateError::ProducerFenced(_)
    )
}

/// Orchestrates Init / AddPartitions / EndTxn / SendOffsets across the
/// transaction log and the participant partitions.
pub struct TransactionCoordinator {
    config: GateConfig,
    coordinator_epoch: i32,
    txn_manager: Arc<TxnStateManager>,
    marker_writer: Arc<dyn MarkerWriter>,
    offsets: Arc<GroupOffsetStore>,
    next_producer_id: AtomicI64,
    shutdown: Arc<AtomicBool>,
    sweep_notify: Arc<Notify>,
}

impl TransactionCoordinator {
    pub fn new(
        config: GateConfig,
        coordinator_epoch: i32,
        txn_manager: Arc<TxnStateManager>,
        marker_writer: Arc<dyn MarkerWriter>,
        offsets: Arc<GroupOffsetStore>,
    ) -> Self {
        Self {
            config,
            coordinator_epoch,
            txn_manager,
            marker_writer,
            offsets,
            next_producer_id: AtomicI64::new(FIRST_PRODUCER_ID),
            shutdown: Arc::new(AtomicBool::new(false)),
            sweep_notify: Arc::new(Notify::new()),
        }
    }

    /// Replay the transaction log and restart the producer id allocator
    /// above everything it has ever handed out.
    pub async fn load(&self) -> Result<()> {
        self.txn_manager.load().await?;
        if let Some(max_pid) = self.txn_manager.max_producer_id() {
            self.next_producer_id
                .store(max_pid + 1, Ordering::SeqCst);
        }
        info!(
            coordinator_epoch = self.coordinator_epoch,
            transactions = self.txn_manager.len(),
            "transaction coordinator loaded"
        );
        Ok(())
    }

    pub fn coordinator_epoch(&self) -> i32 {
        self.coordinator_epoch
    }

    fn alloc_producer_id(&self) -> i64 {
        self.next_producer_id.fetch_add(1, Ordering::SeqCst)
    }

    fn effective_timeout(&self, requested_ms: Option<i64>) -> Result<i64> {
        match requested_ms {
            Some(t) if t > self.config.transaction_max_timeout_ms => {
                Err(GateError::InvalidTransactionTimeout {
                    requested_ms: t,
                    max_ms: self.config.transaction_max_timeout_ms,
                })
            }
            Some(t) if t > 0 => Ok(t),
            _ => Ok(self.config.transaction_default_timeout_ms),
        }
    }

    /// Assign a producer id and epoch for a producer session.
    ///
    /// For a known transactional id in a resting state, the epoch is bumped
    /// (same pid), fencing the prior owner. An ongoing transaction is first
    /// driven through `PrepareAbort` so a zombie can never commit it later.
    pub async fn init_producer_id(
        &self,
        transactional_id: Option<&str>,
        timeout_ms: Option<i64>,
    ) -> Result<(i64, i16)> {
        let timeout = self.effective_timeout(timeout_ms)?;

        let Some(txn_id) = transactional_id else {
            // Idempotent-only producer: fresh pid, no coordinator state
            return Ok((self.alloc_producer_id(), 0));
        };

        self.txn_manager.check_ready(txn_id)?;
        let now = now_ms();

        let Some(mut meta) = self.txn_manager.get(txn_id) else {
            let meta =
                TransactionMetadata::new(txn_id.to_string(), self.alloc_producer_id(), timeout, now);
            let assigned = (meta.producer_id, meta.producer_epoch);
            self.txn_manager.put(meta).await?;
            info!(
                transactional_id = txn_id,
                producer_id = assigned.0,
                "new transactional producer"
            );
            return Ok(assigned);
        };

        if meta.state.is_preparing() {
            return Err(GateError::ConcurrentTransactions(txn_id.to_string()));
        }

        if meta.state == TxnState::Ongoing {
            info!(
                transactional_id = txn_id,
                producer_id = meta.producer_id,
                "aborting in-flight transaction before producer re-initialisation"
            );
            self.finish_txn(&mut meta, ControlType::Abort).await?;
        }

        meta.txn_timeout_ms = timeout;
        let assigned = match meta.bump_epoch(now) {
            Some(epoch) => {
                meta.transition_to(TxnState::Empty, now)?;
                meta.clear_participants();
                (meta.producer_id, epoch)
            }
            None => {
                // Epoch space exhausted: fresh pid, epoch restarts at zero
                let pid = self.alloc_producer_id();
                meta = TransactionMetadata::new(txn_id.to_string(), pid, timeout, now);
                (pid, 0)
            }
        };
        self.txn_manager.put(meta).await?;

        info!(
            transactional_id = txn_id,
            producer_id = assigned.0,
            producer_epoch = assigned.1,
            "producer re-initialised, prior owner fenced"
        );
        Ok(assigned)
    }

    /// Record partitions as transaction participants.
    pub async fn add_partitions_to_txn(
        &self,
        transactional_id: &str,
        producer_id: i64,
        producer_epoch: i16,
        partitions: Vec<TopicId>,
    ) -> Result<()> {
        self.txn_manager.check_ready(transactional_id)?;
        let mut meta = self.lookup(transactional_id, producer_id)?;
        meta.check_producer(producer_id, producer_epoch)?;
        if meta.state.is_preparing() {
            return Err(GateError::ConcurrentTransactions(transactional_id.to_string()));
        }

        debug!(
            transactional_id,
            producer_id,
            count = partitions.len(),
            "adding partitions to transaction"
        );
        meta.add_participants(partitions, now_ms())?;
        self.txn_manager.put(meta).await
    }

    /// Register the group's offsets partition as a participant so the commit
    /// marker reaches it.
    pub async fn add_offsets_to_txn(
        &self,
        transactional_id: &str,
        producer_id: i64,
        producer_epoch: i16,
        group_id: &str,
    ) -> Result<TopicId> {
        self.txn_manager.check_ready(transactional_id)?;
        let mut meta = self.lookup(transactional_id, producer_id)?;
        meta.check_producer(producer_id, producer_epoch)?;
        if meta.state.is_preparing() {
            return Err(GateError::ConcurrentTransactions(transactional_id.to_string()));
        }

        let offsets_tp = offsets_topic_partition(group_id);
        meta.add_participants([offsets_tp.clone()], now_ms())?;
        meta.pending_offset_groups.insert(group_id.to_string());
        self.txn_manager.put(meta).await?;
        Ok(offsets_tp)
    }

    /// Stage consumer offsets inside the transaction. They become visible to
    /// the group only when the commit marker is written.
    pub async fn txn_offset_commit(
        &self,
        transactional_id: &str,
        producer_id: i64,
        producer_epoch: i16,
        group_id: &str,
        offsets: Vec<(TopicId, i64, Option<String>)>,
    ) -> Result<()> {
        self.txn_manager.check_ready(transactional_id)?;
        let meta = self.lookup(transactional_id, producer_id)?;
        meta.check_producer(producer_id, producer_epoch)?;
        if !meta.pending_offset_groups.contains(group_id) {
            return Err(GateError::InvalidTxnState(format!(
                "group {} was not added to transaction {}",
                group_id, transactional_id
            )));
        }

        for (tp, offset, metadata) in offsets {
            self.offsets.stage(
                producer_id,
                PendingTxnOffset {
                    group_id: group_id.to_string(),
                    tp,
                    offset,
                    metadata,
                },
            );
        }
        Ok(())
    }

    /// Commit or abort the transaction: persist the decision, write markers
    /// to every participant, then complete.
    pub async fn end_txn(
        &self,
        transactional_id: &str,
        producer_id: i64,
        producer_epoch: i16,
        commit: bool,
    ) -> Result<()> {
        self.txn_manager.check_ready(transactional_id)?;
        let mut meta = self.lookup(transactional_id, producer_id)?;
        meta.check_producer(producer_id, producer_epoch)?;

        match meta.state {
            TxnState::Ongoing => {}
            // Retried EndTxn after the decision already completed
            TxnState::CompleteCommit if commit => return Ok(()),
            TxnState::CompleteAbort if !commit => return Ok(()),
            TxnState::PrepareCommit | TxnState::PrepareAbort => {
                return Err(GateError::ConcurrentTransactions(transactional_id.to_string()))
            }
            other => {
                return Err(GateError::InvalidTxnState(format!(
                    "end_txn in state {}",
                    other
                )))
            }
        }

        let control = if commit {
            ControlType::Commit
        } else {
            ControlType::Abort
        };
        self.finish_txn(&mut meta, control).await
    }

    /// Drive an `Ongoing` transaction through `Prepare*` to `Complete*`.
    ///
    /// The `Prepare*` append to the transaction log is the acknowledgement
    /// point; everything after it is retried until it succeeds.
    async fn finish_txn(
        &self,
        meta: &mut TransactionMetadata,
        control: ControlType,
    ) -> Result<()> {
        let (prepare, complete) = match control {
            ControlType::Commit => (TxnState::PrepareCommit, TxnState::CompleteCommit),
            ControlType::Abort => (TxnState::PrepareAbort, TxnState::CompleteAbort),
        };

        meta.transition_to(prepare, now_ms())?;
        self.txn_manager.put(meta.clone()).await?;

        self.write_markers(meta, control).await;

        match control {
            ControlType::Commit => {
                self.offsets.commit_pending(meta.producer_id);
            }
            ControlType::Abort => {
                self.offsets.drop_pending(meta.producer_id);
            }
        }

        meta.transition_to(complete, now_ms())?;
        meta.clear_participants();
        self.txn_manager.put(meta.clone()).await?;

        info!(
            transactional_id = %meta.transactional_id,
            producer_id = meta.producer_id,
            committed = control == ControlType::Commit,
            "transaction completed"
        );
        Ok(())
    }

    /// Write markers to all participants concurrently, retrying each until
    /// it lands. Duplicate markers are safe; partition state application is
    /// idempotent.
    async fn write_markers(&self, meta: &TransactionMetadata, control: ControlType) {
        let mut tasks = tokio::task::JoinSet::new();
        for tp in meta.participants.iter().cloned() {
            let writer = Arc::clone(&self.marker_writer);
            let producer_id = meta.producer_id;
            let producer_epoch = meta.producer_epoch;
            let coordinator_epoch = self.coordinator_epoch;
            tasks.spawn(async move {
                let mut backoff = MARKER_RETRY_INITIAL_BACKOFF_MS;
                loop {
                    match writer
                        .write_marker(&tp, producer_id, producer_epoch, control, coordinator_epoch)
                        .await
                    {
                        Ok(offset) => {
                            debug!(partition = %tp, offset, "marker written");
                            return;
                        }
                        Err(e) if marker_write_is_final(&e) => {
                            warn!(partition = %tp, error = %e, "marker superseded, not retrying");
                            return;
                        }
                        Err(e) => {
                            warn!(
                                partition = %tp,
                                error = %e,
                                backoff_ms = backoff,
                                "marker write failed, retrying"
                            );
                            tokio::time::sleep(Duration::from_millis(backoff)).await;
                            backoff = (backoff * 2).min(MARKER_RETRY_MAX_BACKOFF_MS);
                        }
                    }
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    fn lookup(&self, transactional_id: &str, producer_id: i64) -> Result<TransactionMetadata> {
        self.txn_manager
            .get(transactional_id)
            .ok_or_else(|| GateError::InvalidProducerIdMapping {
                transactional_id: transactional_id.to_string(),
                producer_id,
            })
    }

    /// Abort `Ongoing` transactions that outlived their timeout. The prior
    /// owner is fenced by an epoch bump before the abort markers go out.
    pub async fn check_transaction_timeouts(&self) {
        let now = now_ms();
        for mut meta in self.txn_manager.all() {
            if !meta.is_timed_out(now) {
                continue;
            }
            warn!(
                transactional_id = %meta.transactional_id,
                producer_id = meta.producer_id,
                timeout_ms = meta.txn_timeout_ms,
                "transaction timed out, aborting"
            );
            // Exhausted epoch space leaves the old epoch in place; the abort
            // markers still close the transaction.
            meta.bump_epoch(now);
            if let Err(e) = self.finish_txn(&mut meta, ControlType::Abort).await {
                warn!(
                    transactional_id = %meta.transactional_id,
                    error = %e,
                    "failed to abort timed-out transaction"
                );
            }
        }
    }

    /// Tombstone transactional ids idle in a resting state past the
    /// expiration horizon.
    pub async fn expire_transactional_ids(&self) {
        let now = now_ms();
        for meta in self.txn_manager.all() {
            if !meta.is_expirable(now, self.config.transactional_id_expiration_ms) {
                continue;
            }
            info!(
                transactional_id = %meta.transactional_id,
                state = %meta.state,
                "transactional id expired"
            );
            if let Err(e) = self.txn_manager.tombstone(&meta.transactional_id).await {
                warn!(
                    transactional_id = %meta.transactional_id,
                    error = %e,
                    "failed to tombstone expired transactional id"
                );
            }
        }
    }

    /// Start the periodic timeout / expiration sweeper.
    pub fn start_sweeper(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_millis(SWEEP_INTERVAL_MS));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = coordinator.sweep_notify.notified() => {}
                }
                if coordinator.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                coordinator.check_transaction_timeouts().await;
                coordinator.expire_transactional_ids().await;
            }
        });
    }

    /// Force an immediate sweep.
    pub fn trigger_sweep(&self) {
        self.sweep_notify.notify_one();
    }

    /// Stop the sweeper.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.sweep_notify.notify_one();
    }

    // ==================== Admin plane ====================

    /// List transactions, optionally filtered by state or producer id.
    pub fn list_transactions(
        &self,
        state_filters: &[TxnState],
        producer_id_filters: &[i64],
    ) -> Vec<TransactionMetadata> {
        self.txn_manager
            .all()
            .into_iter()
            .filter(|m| state_filters.is_empty() || state_filters.contains(&m.state))
            .filter(|m| {
                producer_id_filters.is_empty() || producer_id_filters.contains(&m.producer_id)
            })
            .collect()
    }

    /// Full metadata for one transactional id.
    pub fn describe_transaction(&self, transactional_id: &str) -> Option<TransactionMetadata> {
        self.txn_manager.get(transactional_id)
    }

    /// Write an abort marker directly to one partition.
    ///
    /// This deliberately bypasses coordinator state: it is the admin-plane
    /// escape hatch for a partition stuck on a dangling transaction, and the
    /// coordinator may keep reporting the transaction as `Ongoing` until its
    /// own timeout sweep fires.
    pub async fn abort_transaction_on_partition(
        &self,
        tp: &TopicId,
        producer_id: i64,
        producer_epoch: i16,
        coordinator_epoch: i32,
    ) -> Result<i64> {
        self.marker_writer
            .write_marker(
                tp,
                producer_id,
                producer_epoch,
                ControlType::Abort,
                coordinator_epoch,
            )
            .await
    }
}
