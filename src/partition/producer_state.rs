//! Per-partition producer state management
//!
//! This is the partition-local authority on idempotence and transaction
//! membership: for every producer writing to the partition it tracks the
//! epoch, a sliding window of recent batches (for duplicate detection), and
//! the ongoing transaction's first offset. Aborted transactions are kept in
//! an ordered index so `read_committed` consumers can filter them out.
//!
//! All state here is plain memory. The owning `PartitionLog` serializes every
//! mutation, so methods take `&mut self` and never suspend.

use crate::config::GateConfig;
use crate::error::{GateError, Result};
use crate::partition::snapshot::ProducerStateSnapshot;
use crate::protocol::records::{BatchInfo, ControlType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{debug, warn};
use uuid::Uuid;

/// Producer ID type (matches Kafka's long type)
pub type ProducerId = i64;

/// Producer epoch type (matches Kafka's short type)
pub type ProducerEpoch = i16;

/// Sequence number type (matches Kafka's int type)
pub type SequenceNumber = i32;

/// Number of recent batches retained per producer for duplicate detection
const BATCH_WINDOW_SIZE: usize = 5;

/// Sequence numbers wrap at 2^31
const SEQUENCE_WRAP: i64 = 1 << 31;

/// The sequence expected to follow `last`, with wrap at 2^31.
pub fn next_sequence(last: SequenceNumber) -> SequenceNumber {
    ((i64::from(last) + 1) % SEQUENCE_WRAP) as SequenceNumber
}

/// Metadata of one appended batch, retained in the idempotence window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMetadata {
    pub base_sequence: SequenceNumber,
    pub last_sequence: SequenceNumber,
    pub base_offset: i64,
    pub last_offset: i64,
    pub timestamp: i64,
}

/// State of one producer on one partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerStateEntry {
    pub producer_id: ProducerId,
    pub producer_epoch: ProducerEpoch,
    /// Epoch of the coordinator that last wrote a marker for this producer
    pub coordinator_epoch: i32,
    pub last_timestamp: i64,
    /// Recent batches, oldest first
    pub batch_window: VecDeque<BatchMetadata>,
    /// First offset of the transaction this producer currently has open here
    pub current_txn_first_offset: Option<i64>,
}

impl ProducerStateEntry {
    fn new(producer_id: ProducerId, producer_epoch: ProducerEpoch) -> Self {
        Self {
            producer_id,
            producer_epoch,
            coordinator_epoch: -1,
            last_timestamp: chrono::Utc::now().timestamp_millis(),
            batch_window: VecDeque::new(),
            current_txn_first_offset: None,
        }
    }

    /// Last accepted sequence number, if any batch is retained
    pub fn last_sequence(&self) -> Option<SequenceNumber> {
        self.batch_window.back().map(|b| b.last_sequence)
    }

    /// Last offset written by this producer, if any batch is retained
    pub fn last_offset(&self) -> Option<i64> {
        self.batch_window.back().map(|b| b.last_offset)
    }

    fn find_duplicate(&self, info: &BatchInfo) -> Option<&BatchMetadata> {
        self.batch_window.iter().find(|b| {
            b.base_sequence == info.base_sequence && b.last_sequence == info.last_sequence()
        })
    }

    fn push_batch(&mut self, info: &BatchInfo, base_offset: i64) {
        self.last_timestamp = chrono::Utc::now().timestamp_millis();
        self.batch_window.push_back(BatchMetadata {
            base_sequence: info.base_sequence,
            last_sequence: info.last_sequence(),
            base_offset,
            last_offset: base_offset + i64::from(info.record_count) - 1,
            timestamp: self.last_timestamp,
        });
        while self.batch_window.len() > BATCH_WINDOW_SIZE {
            self.batch_window.pop_front();
        }
    }
}

/// An ongoing transaction on this partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OngoingTxn {
    pub producer_id: ProducerId,
    pub producer_epoch: ProducerEpoch,
    pub first_offset: i64,
}

/// An aborted transaction, as consumers need it for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortedTxn {
    pub producer_id: ProducerId,
    pub first_offset: i64,
    pub last_offset: i64,
    /// Last stable offset when the abort marker was written
    pub last_stable_offset: i64,
}

/// Outcome of validating a produce batch against producer state.
///
/// This is a closed set: every produce either proceeds, answers from the
/// idempotence window, or is rejected with one of the typed refusals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    /// Proceed with the append
    Ok,
    /// Batch was already appended; answer with its original offsets
    Duplicate { base_offset: i64, last_offset: i64 },
    /// Gap in the sequence; fatal for the producer session
    OutOfOrder {
        expected: SequenceNumber,
        received: SequenceNumber,
    },
    /// Stale epoch; the producer has been fenced
    Fenced {
        current: ProducerEpoch,
        received: ProducerEpoch,
    },
}

/// A transaction closed by a marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedTxn {
    pub producer_id: ProducerId,
    pub first_offset: i64,
    pub last_offset: i64,
    pub is_aborted: bool,
}

/// Per-partition table of producer entries plus the aborted-transaction index.
#[derive(Debug)]
pub struct ProducerStateManager {
    producers: HashMap<ProducerId, ProducerStateEntry>,
    /// Ongoing transactions keyed by first offset; the first entry is the
    /// first unstable offset.
    ongoing_txns: BTreeMap<i64, OngoingTxn>,
    /// Aborted transactions sorted by first offset
    aborted_txns: Vec<AbortedTxn>,
    /// Offset replay must resume from after a snapshot restore
    recovery_point: i64,
    producer_expiration_ms: i64,
    max_producers: usize,
}

impl ProducerStateManager {
    pub fn new(config: &GateConfig) -> Self {
        Self {
            producers: HashMap::new(),
            ongoing_txns: BTreeMap::new(),
            aborted_txns: Vec::new(),
            recovery_point: 0,
            producer_expiration_ms: config.producer_id_expiration_ms,
            max_producers: config.max_active_producers_per_partition,
        }
    }

    /// Validate a batch before it is handed to the store.
    ///
    /// Stale epochs are fenced here, on the append itself, rather than
    /// surfacing later at commit time.
    pub fn validate_append(&self, info: &BatchInfo) -> SequenceCheck {
        if !info.is_idempotent() {
            return SequenceCheck::Ok;
        }

        let entry = match self.producers.get(&info.producer_id) {
            Some(entry) => entry,
            None => {
                // First batch from a producer must start its sequence at 0
                if info.base_sequence == 0 {
                    return SequenceCheck::Ok;
                }
                return SequenceCheck::OutOfOrder {
                    expected: 0,
                    received: info.base_sequence,
                };
            }
        };

        if info.producer_epoch < entry.producer_epoch {
            return SequenceCheck::Fenced {
                current: entry.producer_epoch,
                received: info.producer_epoch,
            };
        }

        if info.producer_epoch > entry.producer_epoch {
            // Epoch bump resets the sequence space
            if info.base_sequence == 0 {
                return SequenceCheck::Ok;
            }
            return SequenceCheck::OutOfOrder {
                expected: 0,
                received: info.base_sequence,
            };
        }

        if let Some(batch) = entry.find_duplicate(info) {
            debug!(
                producer_id = info.producer_id,
                base_sequence = info.base_sequence,
                base_offset = batch.base_offset,
                "duplicate batch answered from idempotence window"
            );
            return SequenceCheck::Duplicate {
                base_offset: batch.base_offset,
                last_offset: batch.last_offset,
            };
        }

        match entry.last_sequence() {
            Some(last) => {
                let expected = next_sequence(last);
                if info.base_sequence == expected {
                    SequenceCheck::Ok
                } else {
                    SequenceCheck::OutOfOrder {
                        expected,
                        received: info.base_sequence,
                    }
                }
            }
            // Entry restored without batch history accepts any continuation
            None => SequenceCheck::Ok,
        }
    }

    /// Install a validated batch at its assigned offsets.
    pub fn update_append(&mut self, info: &BatchInfo, base_offset: i64) {
        if !info.is_idempotent() {
            return;
        }

        if self.producers.len() >= self.max_producers
            && !self.producers.contains_key(&info.producer_id)
        {
            self.evict_oldest_idle();
        }

        let entry = self
            .producers
            .entry(info.producer_id)
            .or_insert_with(|| ProducerStateEntry::new(info.producer_id, info.producer_epoch));

        if info.producer_epoch > entry.producer_epoch {
            entry.producer_epoch = info.producer_epoch;
            entry.batch_window.clear();
        }
        entry.push_batch(info, base_offset);

        if info.is_transactional && entry.current_txn_first_offset.is_none() {
            entry.current_txn_first_offset = Some(base_offset);
            self.ongoing_txns.insert(
                base_offset,
                OngoingTxn {
                    producer_id: info.producer_id,
                    producer_epoch: info.producer_epoch,
                    first_offset: base_offset,
                },
            );
        }
    }

    /// Validate and install in one step. The live append path splits the two
    /// around the store append; recovery and tests use this combined form.
    pub fn validate_and_update(&mut self, info: &BatchInfo, base_offset: i64) -> Result<()> {
        match self.validate_append(info) {
            SequenceCheck::Ok => {
                self.update_append(info, base_offset);
                Ok(())
            }
            SequenceCheck::Duplicate {
                base_offset,
                last_offset,
            } => Err(GateError::DuplicateSequenceNumber {
                base_offset,
                last_offset,
            }),
            SequenceCheck::OutOfOrder { expected, received } => {
                Err(GateError::OutOfOrderSequenceNumber { expected, received })
            }
            SequenceCheck::Fenced { current, received } => Err(GateError::InvalidProducerEpoch {
                current,
                received,
            }),
        }
    }

    /// Install a batch replayed from the log during recovery.
    ///
    /// The log is authoritative, so no sequence validation: a partition
    /// recovering from the post-trim head may well see a producer mid-stream.
    pub fn apply_replay_batch(&mut self, info: &BatchInfo, base_offset: i64) {
        if !info.is_idempotent() {
            return;
        }
        let entry = self
            .producers
            .entry(info.producer_id)
            .or_insert_with(|| ProducerStateEntry::new(info.producer_id, info.producer_epoch));
        if info.producer_epoch > entry.producer_epoch {
            entry.producer_epoch = info.producer_epoch;
            entry.batch_window.clear();
        }
        entry.push_batch(info, base_offset);
        if info.is_transactional && entry.current_txn_first_offset.is_none() {
            entry.current_txn_first_offset = Some(base_offset);
            self.ongoing_txns.insert(
                base_offset,
                OngoingTxn {
                    producer_id: info.producer_id,
                    producer_epoch: info.producer_epoch,
                    first_offset: base_offset,
                },
            );
        }
    }

    /// Apply a transaction marker, closing the producer's open transaction.
    ///
    /// Marker delivery is at-least-once, so this is idempotent: a marker for
    /// an already-closed or unknown transaction is a no-op.
    pub fn complete_txn(
        &mut self,
        producer_id: ProducerId,
        producer_epoch: ProducerEpoch,
        control_type: ControlType,
        marker_offset: i64,
        coordinator_epoch: i32,
    ) -> Result<Option<CompletedTxn>> {
        let entry = match self.producers.get_mut(&producer_id) {
            Some(entry) => entry,
            None => {
                warn!(
                    producer_id,
                    marker_offset, "marker for unknown producer ignored"
                );
                return Ok(None);
            }
        };

        if producer_epoch < entry.producer_epoch {
            return Err(GateError::InvalidProducerEpoch {
                current: entry.producer_epoch,
                received: producer_epoch,
            });
        }
        if coordinator_epoch >= 0 && coordinator_epoch < entry.coordinator_epoch {
            return Err(GateError::TransactionCoordinatorFenced {
                current: entry.coordinator_epoch,
                received: coordinator_epoch,
            });
        }

        entry.producer_epoch = producer_epoch;
        if coordinator_epoch >= 0 {
            entry.coordinator_epoch = coordinator_epoch;
        }
        entry.last_timestamp = chrono::Utc::now().timestamp_millis();

        let first_offset = match entry.current_txn_first_offset.take() {
            Some(offset) => offset,
            None => return Ok(None), // already completed
        };

        self.ongoing_txns.remove(&first_offset);

        let completed = CompletedTxn {
            producer_id,
            first_offset,
            last_offset: marker_offset - 1,
            is_aborted: control_type == ControlType::Abort,
        };

        if completed.is_aborted {
            let aborted = AbortedTxn {
                producer_id,
                first_offset,
                last_offset: completed.last_offset,
                last_stable_offset: self.first_unstable_offset().unwrap_or(marker_offset),
            };
            let at = self
                .aborted_txns
                .partition_point(|t| t.first_offset <= aborted.first_offset);
            self.aborted_txns.insert(at, aborted);
        }

        debug!(
            producer_id,
            first_offset,
            marker_offset,
            aborted = completed.is_aborted,
            "transaction completed on partition"
        );
        Ok(Some(completed))
    }

    /// Aborted transactions overlapping the inclusive offset range.
    pub fn aborted_txns_overlapping(&self, fetch_start: i64, fetch_end: i64) -> Vec<AbortedTxn> {
        let end = self
            .aborted_txns
            .partition_point(|t| t.first_offset <= fetch_end);
        self.aborted_txns[..end]
            .iter()
            .filter(|t| t.last_offset >= fetch_start)
            .copied()
            .collect()
    }

    /// First offset of the earliest open transaction, if any.
    pub fn first_unstable_offset(&self) -> Option<i64> {
        self.ongoing_txns.keys().next().copied()
    }

    /// Take a snapshot consistent with everything applied up to `offset`.
    pub fn snapshot(&self, topic_uuid: Uuid, offset: i64) -> ProducerStateSnapshot {
        ProducerStateSnapshot {
            version: ProducerStateSnapshot::CURRENT_VERSION,
            topic_uuid,
            offset,
            producers: self.producers.clone(),
            ongoing_txns: self.ongoing_txns.clone(),
            aborted_txns: self.aborted_txns.clone(),
        }
    }

    /// Reset state to a snapshot; replay resumes from `snapshot.offset + 1`.
    pub fn load_from_snapshot(&mut self, snapshot: ProducerStateSnapshot) {
        self.producers = snapshot.producers;
        self.ongoing_txns = snapshot.ongoing_txns;
        self.aborted_txns = snapshot.aborted_txns;
        self.recovery_point = snapshot.offset + 1;
    }

    /// Offset recovery must replay from.
    pub fn recovery_point(&self) -> i64 {
        self.recovery_point
    }

    pub fn set_recovery_point(&mut self, offset: i64) {
        self.recovery_point = offset;
    }

    /// Drop aborted-transaction entries wholly below `min_valid_offset`.
    ///
    /// Safe once the store has trimmed the covering data: no fetch can start
    /// below the oldest available offset anymore.
    pub fn purge_aborted_before(&mut self, min_valid_offset: i64) -> usize {
        let before = self.aborted_txns.len();
        self.aborted_txns
            .retain(|t| t.last_offset >= min_valid_offset);
        before - self.aborted_txns.len()
    }

    /// Evict idle producer entries past the expiration horizon. Entries with
    /// an ongoing transaction are never evicted.
    pub fn evict_expired(&mut self, now_ms: i64) -> usize {
        let cutoff = now_ms - self.producer_expiration_ms;
        let before = self.producers.len();
        self.producers
            .retain(|_, e| e.current_txn_first_offset.is_some() || e.last_timestamp >= cutoff);
        before - self.producers.len()
    }

    fn evict_oldest_idle(&mut self) {
        let oldest = self
            .producers
            .values()
            .filter(|e| e.current_txn_first_offset.is_none())
            .min_by_key(|e| e.last_timestamp)
            .map(|e| e.producer_id);
        if let Some(pid) = oldest {
            self.producers.remove(&pid);
        }
    }

    /// Entries for all tracked producers, for the admin plane.
    pub fn producers(&self) -> impl Iterator<Item = &ProducerStateEntry> {
        self.producers.values()
    }

    pub fn get(&self, producer_id: ProducerId) -> Option<&ProducerStateEntry> {
        self.producers.get(&producer_id)
    }

    /// First offsets of the aborted index, oldest first. Test observability.
    pub fn aborted_first_offsets(&self) -> Vec<i64> {
        self.aborted_txns.iter().map(|t| t.first_offset).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ProducerStateManager {
        ProducerStateManager::new(&GateConfig::default())
    }

    fn batch(pid: i64, epoch: i16, base_seq: i32, count: i32, txn: bool) -> BatchInfo {
        BatchInfo {
            producer_id: pid,
            producer_epoch: epoch,
            base_sequence: base_seq,
            record_count: count,
            is_transactional: txn,
            is_control: false,
        }
    }

    #[test]
    fn test_monotonic_sequence_accepted() {
        let mut mgr = manager();
        mgr.validate_and_update(&batch(1, 0, 0, 3, false), 0).unwrap();
        mgr.validate_and_update(&batch(1, 0, 3, 2, false), 3).unwrap();
        assert_eq!(mgr.get(1).unwrap().last_sequence(), Some(4));
        assert_eq!(mgr.get(1).unwrap().last_offset(), Some(4));
    }

    #[test]
    fn test_duplicate_returns_original_offsets() {
        let mut mgr = manager();
        mgr.validate_and_update(&batch(1, 0, 0, 3, false), 10).unwrap();

        match mgr.validate_append(&batch(1, 0, 0, 3, false)) {
            SequenceCheck::Duplicate {
                base_offset,
                last_offset,
            } => {
                assert_eq!(base_offset, 10);
                assert_eq!(last_offset, 12);
            }
            other => panic!("expected Duplicate, got {:?}", other),
        }
    }

    #[test]
    fn test_out_of_order_rejected() {
        let mut mgr = manager();
        mgr.validate_and_update(&batch(1, 0, 0, 1, false), 0).unwrap();

        let err = mgr.validate_and_update(&batch(1, 0, 5, 1, false), 1).unwrap_err();
        match err {
            GateError::OutOfOrderSequenceNumber { expected, received } => {
                assert_eq!(expected, 1);
                assert_eq!(received, 5);
            }
            other => panic!("expected OutOfOrderSequenceNumber, got {:?}", other),
        }
    }

    #[test]
    fn test_new_producer_must_start_at_zero() {
        let mgr = manager();
        match mgr.validate_append(&batch(1, 0, 7, 1, false)) {
            SequenceCheck::OutOfOrder { expected, .. } => assert_eq!(expected, 0),
            other => panic!("expected OutOfOrder, got {:?}", other),
        }
    }

    #[test]
    fn test_stale_epoch_fenced_on_append() {
        let mut mgr = manager();
        mgr.validate_and_update(&batch(1, 1, 0, 1, true), 0).unwrap();

        match mgr.validate_append(&batch(1, 0, 1, 1, true)) {
            SequenceCheck::Fenced { current, received } => {
                assert_eq!(current, 1);
                assert_eq!(received, 0);
            }
            other => panic!("expected Fenced, got {:?}", other),
        }
    }

    #[test]
    fn test_epoch_bump_resets_sequence() {
        let mut mgr = manager();
        mgr.validate_and_update(&batch(1, 0, 0, 5, false), 0).unwrap();

        // New epoch restarts at sequence 0
        mgr.validate_and_update(&batch(1, 1, 0, 1, false), 5).unwrap();
        assert_eq!(mgr.get(1).unwrap().producer_epoch, 1);
        assert_eq!(mgr.get(1).unwrap().last_sequence(), Some(0));

        // New epoch with nonzero start is out of order
        let mut mgr = manager();
        mgr.validate_and_update(&batch(1, 0, 0, 5, false), 0).unwrap();
        assert!(matches!(
            mgr.validate_append(&batch(1, 1, 3, 1, false)),
            SequenceCheck::OutOfOrder { expected: 0, .. }
        ));
    }

    #[test]
    fn test_sequence_wrap() {
        assert_eq!(next_sequence(i32::MAX), 0);
        assert_eq!(next_sequence(0), 1);

        let mut mgr = manager();
        // Restore an entry sitting at the wrap boundary
        let mut entry = ProducerStateEntry::new(1, 0);
        entry.batch_window.push_back(BatchMetadata {
            base_sequence: i32::MAX,
            last_sequence: i32::MAX,
            base_offset: 100,
            last_offset: 100,
            timestamp: 0,
        });
        mgr.producers.insert(1, entry);

        assert_eq!(
            mgr.validate_append(&batch(1, 0, 0, 1, false)),
            SequenceCheck::Ok
        );
    }

    #[test]
    fn test_exclusive_ongoing_txn() {
        let mut mgr = manager();
        mgr.validate_and_update(&batch(1, 0, 0, 2, true), 0).unwrap();
        mgr.validate_and_update(&batch(1, 0, 2, 2, true), 2).unwrap();

        // Second transactional batch does not move the first offset
        assert_eq!(mgr.get(1).unwrap().current_txn_first_offset, Some(0));
        assert_eq!(mgr.first_unstable_offset(), Some(0));
    }

    #[test]
    fn test_complete_txn_commit() {
        let mut mgr = manager();
        mgr.validate_and_update(&batch(1, 0, 0, 2, true), 0).unwrap();

        let completed = mgr
            .complete_txn(1, 0, ControlType::Commit, 2, 0)
            .unwrap()
            .unwrap();
        assert_eq!(completed.first_offset, 0);
        assert_eq!(completed.last_offset, 1);
        assert!(!completed.is_aborted);
        assert_eq!(mgr.first_unstable_offset(), None);
        assert!(mgr.aborted_first_offsets().is_empty());
    }

    #[test]
    fn test_complete_txn_abort_feeds_index() {
        let mut mgr = manager();
        mgr.validate_and_update(&batch(1, 0, 0, 2, true), 0).unwrap();

        let completed = mgr
            .complete_txn(1, 0, ControlType::Abort, 2, 0)
            .unwrap()
            .unwrap();
        assert!(completed.is_aborted);
        assert_eq!(mgr.aborted_first_offsets(), vec![0]);

        let overlapping = mgr.aborted_txns_overlapping(0, 10);
        assert_eq!(overlapping.len(), 1);
        assert_eq!(overlapping[0].last_offset, 1);
    }

    #[test]
    fn test_marker_idempotence() {
        let mut mgr = manager();
        mgr.validate_and_update(&batch(1, 0, 0, 2, true), 0).unwrap();

        mgr.complete_txn(1, 0, ControlType::Abort, 2, 0).unwrap();
        let snapshot_after_first = mgr.snapshot(Uuid::nil(), 2);

        // Re-delivered marker changes nothing
        let second = mgr.complete_txn(1, 0, ControlType::Abort, 2, 0).unwrap();
        assert!(second.is_none());
        let snapshot_after_second = mgr.snapshot(Uuid::nil(), 2);
        assert_eq!(
            snapshot_after_first.aborted_txns,
            snapshot_after_second.aborted_txns
        );
        assert_eq!(
            snapshot_after_first.ongoing_txns,
            snapshot_after_second.ongoing_txns
        );
    }

    #[test]
    fn test_marker_epoch_fencing() {
        let mut mgr = manager();
        mgr.validate_and_update(&batch(1, 2, 0, 1, true), 0).unwrap();

        let err = mgr.complete_txn(1, 1, ControlType::Commit, 1, 0).unwrap_err();
        assert!(matches!(err, GateError::InvalidProducerEpoch { .. }));
    }

    #[test]
    fn test_marker_coordinator_fencing() {
        let mut mgr = manager();
        mgr.validate_and_update(&batch(1, 0, 0, 1, true), 0).unwrap();
        mgr.complete_txn(1, 0, ControlType::Commit, 1, 5).unwrap();

        mgr.validate_and_update(&batch(1, 0, 1, 1, true), 2).unwrap();
        let err = mgr.complete_txn(1, 0, ControlType::Commit, 3, 4).unwrap_err();
        assert!(matches!(err, GateError::TransactionCoordinatorFenced { .. }));
    }

    #[test]
    fn test_marker_for_unknown_producer_is_noop() {
        let mut mgr = manager();
        let completed = mgr.complete_txn(99, 0, ControlType::Abort, 5, 0).unwrap();
        assert!(completed.is_none());
    }

    #[test]
    fn test_aborted_index_stays_sorted() {
        let mut mgr = manager();
        for (pid, first, marker) in [(1i64, 0i64, 3i64), (2, 10, 13), (3, 5, 8)] {
            let mut entry = ProducerStateEntry::new(pid, 0);
            entry.current_txn_first_offset = Some(first);
            mgr.producers.insert(pid, entry);
            mgr.ongoing_txns.insert(
                first,
                OngoingTxn {
                    producer_id: pid,
                    producer_epoch: 0,
                    first_offset: first,
                },
            );
            mgr.complete_txn(pid, 0, ControlType::Abort, marker, 0).unwrap();
        }

        assert_eq!(mgr.aborted_first_offsets(), vec![0, 5, 10]);
        for t in &mgr.aborted_txns {
            assert!(t.last_offset >= t.first_offset);
        }
    }

    #[test]
    fn test_overlap_query_bounds() {
        let mut mgr = manager();
        mgr.aborted_txns = vec![
            AbortedTxn {
                producer_id: 1,
                first_offset: 0,
                last_offset: 2,
                last_stable_offset: 3,
            },
            AbortedTxn {
                producer_id: 2,
                first_offset: 11,
                last_offset: 12,
                last_stable_offset: 13,
            },
        ];

        assert_eq!(mgr.aborted_txns_overlapping(0, 100).len(), 2);
        assert_eq!(mgr.aborted_txns_overlapping(3, 10).len(), 0);
        assert_eq!(mgr.aborted_txns_overlapping(2, 2).len(), 1);
        assert_eq!(mgr.aborted_txns_overlapping(12, 20).len(), 1);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut mgr = manager();
        mgr.validate_and_update(&batch(1, 0, 0, 3, true), 0).unwrap();
        mgr.validate_and_update(&batch(2, 1, 0, 2, true), 3).unwrap();
        mgr.complete_txn(2, 1, ControlType::Abort, 5, 0).unwrap();

        let uuid = Uuid::new_v4();
        let snap = mgr.snapshot(uuid, 5);

        let mut restored = manager();
        restored.load_from_snapshot(snap.clone());

        assert_eq!(restored.recovery_point(), 6);
        assert_eq!(restored.snapshot(uuid, 5), snap);
        assert_eq!(restored.first_unstable_offset(), Some(0));
        assert_eq!(restored.aborted_first_offsets(), vec![0]);
    }

    #[test]
    fn test_purge_safety() {
        let mut mgr = manager();
        mgr.aborted_txns = vec![
            AbortedTxn {
                producer_id: 1,
                first_offset: 0,
                last_offset: 2,
                last_stable_offset: 3,
            },
            AbortedTxn {
                producer_id: 2,
                first_offset: 11,
                last_offset: 12,
                last_stable_offset: 13,
            },
        ];

        let after_purge_query = mgr.aborted_txns_overlapping(5, 20);
        assert_eq!(mgr.purge_aborted_before(5), 1);
        assert_eq!(mgr.aborted_first_offsets(), vec![11]);
        // Queries at or past the purge point are unchanged
        assert_eq!(mgr.aborted_txns_overlapping(5, 20), after_purge_query);
    }

    #[test]
    fn test_eviction_spares_ongoing_txns() {
        let mut mgr = manager();
        mgr.validate_and_update(&batch(1, 0, 0, 1, true), 0).unwrap();
        mgr.validate_and_update(&batch(2, 0, 0, 1, false), 1).unwrap();

        // Everything is "old" relative to a far-future now
        let far_future = chrono::Utc::now().timestamp_millis() + 365 * 24 * 3600 * 1000;
        let evicted = mgr.evict_expired(far_future);

        assert_eq!(evicted, 1);
        assert!(mgr.get(1).is_some());
        assert!(mgr.get(2).is_none());
    }
}
