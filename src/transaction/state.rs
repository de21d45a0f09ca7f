//! Transaction state structures
//!
//! Defines the per-transactional-id state machine and the metadata record
//! persisted to the internal transaction log. A non-terminal transaction has
//! exactly one owner `(producer_id, producer_epoch)`; requests from a stale
//! owner are fenced.

use crate::error::{GateError, Result};
use crate::store::TopicId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Transaction state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnState {
    /// Producer id assigned, no transaction open
    Empty,
    /// Transaction open, partitions may be added
    Ongoing,
    /// Commit decided and persisted; markers being written
    PrepareCommit,
    /// Abort decided and persisted; markers being written
    PrepareAbort,
    /// All commit markers written
    CompleteCommit,
    /// All abort markers written
    CompleteAbort,
    /// Transactional id expired; tombstoned from the log
    Dead,
}

impl TxnState {
    /// Check if this state allows adding participant partitions
    pub fn can_add_partitions(&self) -> bool {
        matches!(self, TxnState::Empty | TxnState::Ongoing)
    }

    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TxnState::CompleteCommit | TxnState::CompleteAbort | TxnState::Dead
        )
    }

    /// States from which `InitProducerId` may hand the id to a new owner
    pub fn can_init(&self) -> bool {
        matches!(
            self,
            TxnState::Empty | TxnState::CompleteCommit | TxnState::CompleteAbort
        )
    }

    /// Check if markers are in flight for this state
    pub fn is_preparing(&self) -> bool {
        matches!(self, TxnState::PrepareCommit | TxnState::PrepareAbort)
    }

    /// Valid successor states
    pub fn can_transition_to(&self, next: TxnState) -> bool {
        use TxnState::*;
        match (self, next) {
            (Empty, Ongoing) => true,
            (Ongoing, PrepareCommit) | (Ongoing, PrepareAbort) => true,
            (PrepareCommit, CompleteCommit) => true,
            (PrepareAbort, CompleteAbort) => true,
            // InitProducerId resets a terminal transaction to Empty
            (Empty, Empty)
            | (CompleteCommit, Empty)
            | (CompleteAbort, Empty) => true,
            (CompleteCommit, Dead) | (CompleteAbort, Dead) | (Empty, Dead) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TxnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TxnState::Empty => "Empty",
            TxnState::Ongoing => "Ongoing",
            TxnState::PrepareCommit => "PrepareCommit",
            TxnState::PrepareAbort => "PrepareAbort",
            TxnState::CompleteCommit => "CompleteCommit",
            TxnState::CompleteAbort => "CompleteAbort",
            TxnState::Dead => "Dead",
        };
        f.write_str(name)
    }
}

/// Per-transactional-id metadata, persisted on every state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionMetadata {
    pub transactional_id: String,
    pub producer_id: i64,
    pub producer_epoch: i16,
    /// Epoch before the most recent bump, for KIP-360 retry recognition
    pub last_producer_epoch: i16,
    pub txn_timeout_ms: i64,
    pub state: TxnState,
    pub participants: HashSet<TopicId>,
    /// Consumer groups with offsets pending in this transaction
    pub pending_offset_groups: HashSet<String>,
    pub start_time_ms: i64,
    pub last_update_ms: i64,
}

impl TransactionMetadata {
    pub fn new(
        transactional_id: String,
        producer_id: i64,
        txn_timeout_ms: i64,
        now_ms: i64,
    ) -> Self {
        Self {
            transactional_id,
            producer_id,
            producer_epoch: 0,
            last_producer_epoch: -1,
            txn_timeout_ms,
            state: TxnState::Empty,
            participants: HashSet::new(),
            pending_offset_groups: HashSet::new(),
            start_time_ms: now_ms,
            last_update_ms: now_ms,
        }
    }

    /// Fence requests from a stale owner: a mismatched producer id or a
    /// strictly lower epoch is rejected.
    pub fn check_producer(&self, producer_id: i64, producer_epoch: i16) -> Result<()> {
        if self.producer_id != producer_id {
            return Err(GateError::ProducerFenced(self.transactional_id.clone()));
        }
        if producer_epoch < self.producer_epoch {
            return Err(GateError::ProducerFenced(self.transactional_id.clone()));
        }
        if producer_epoch > self.producer_epoch {
            // A newer epoch than we recorded means our view is stale
            return Err(GateError::InvalidProducerEpoch {
                current: self.producer_epoch,
                received: producer_epoch,
            });
        }
        Ok(())
    }

    /// Move to `next`, refusing transitions the state machine does not allow.
    pub fn transition_to(&mut self, next: TxnState, now_ms: i64) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(GateError::InvalidTxnState(format!(
                "{}: {} -> {}",
                self.transactional_id, self.state, next
            )));
        }
        if next == TxnState::Ongoing && self.state != TxnState::Ongoing {
            self.start_time_ms = now_ms;
        }
        self.state = next;
        self.last_update_ms = now_ms;
        Ok(())
    }

    /// Add participants; only legal in `Empty` (implicit begin) or `Ongoing`.
    pub fn add_participants(
        &mut self,
        partitions: impl IntoIterator<Item = TopicId>,
        now_ms: i64,
    ) -> Result<()> {
        if !self.state.can_add_partitions() {
            return Err(GateError::InvalidTxnState(format!(
                "cannot add partitions in {}",
                self.state
            )));
        }
        if self.state == TxnState::Empty {
            self.transition_to(TxnState::Ongoing, now_ms)?;
        }
        self.participants.extend(partitions);
        self.last_update_ms = now_ms;
        Ok(())
    }

    /// Bump the producer epoch, fencing the previous owner. Returns `None`
    /// when the epoch space is exhausted and a fresh producer id is needed.
    pub fn bump_epoch(&mut self, now_ms: i64) -> Option<i16> {
        if self.producer_epoch == i16::MAX {
            return None;
        }
        self.last_producer_epoch = self.producer_epoch;
        self.producer_epoch += 1;
        self.last_update_ms = now_ms;
        Some(self.producer_epoch)
    }

    /// An `Ongoing` transaction past its timeout must be aborted.
    pub fn is_timed_out(&self, now_ms: i64) -> bool {
        self.state == TxnState::Ongoing && now_ms - self.last_update_ms > self.txn_timeout_ms
    }

    /// An id idle in a resting state past the expiration horizon is forgotten.
    pub fn is_expirable(&self, now_ms: i64, expiration_ms: i64) -> bool {
        self.state.can_init() && now_ms - self.last_update_ms > expiration_ms
    }

    /// Clear per-transaction bookkeeping after completion.
    pub fn clear_participants(&mut self) {
        self.participants.clear();
        self.pending_offset_groups.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> TransactionMetadata {
        TransactionMetadata::new("txn-1".to_string(), 1000, 60_000, 0)
    }

    #[test]
    fn test_commit_path_transitions() {
        let mut m = meta();
        assert_eq!(m.state, TxnState::Empty);

        m.add_participants([TopicId::new("t", 0)], 1).unwrap();
        assert_eq!(m.state, TxnState::Ongoing);

        m.transition_to(TxnState::PrepareCommit, 2).unwrap();
        m.transition_to(TxnState::CompleteCommit, 3).unwrap();
        assert!(m.state.is_terminal());
    }

    #[test]
    fn test_abort_path_transitions() {
        let mut m = meta();
        m.add_participants([TopicId::new("t", 0)], 1).unwrap();
        m.transition_to(TxnState::PrepareAbort, 2).unwrap();
        m.transition_to(TxnState::CompleteAbort, 3).unwrap();
        assert!(m.state.is_terminal());
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut m = meta();
        assert!(m.transition_to(TxnState::PrepareCommit, 1).is_err());

        m.add_participants([TopicId::new("t", 0)], 1).unwrap();
        m.transition_to(TxnState::PrepareCommit, 2).unwrap();
        let err = m.transition_to(TxnState::CompleteAbort, 3).unwrap_err();
        assert!(matches!(err, GateError::InvalidTxnState(_)));
    }

    #[test]
    fn test_no_participants_after_prepare() {
        let mut m = meta();
        m.add_participants([TopicId::new("t", 0)], 1).unwrap();
        m.transition_to(TxnState::PrepareCommit, 2).unwrap();

        let err = m.add_participants([TopicId::new("t", 1)], 3).unwrap_err();
        assert!(matches!(err, GateError::InvalidTxnState(_)));
    }

    #[test]
    fn test_fencing_lower_epoch() {
        let mut m = meta();
        m.bump_epoch(1).unwrap();
        assert_eq!(m.producer_epoch, 1);
        assert_eq!(m.last_producer_epoch, 0);

        let err = m.check_producer(1000, 0).unwrap_err();
        assert!(matches!(err, GateError::ProducerFenced(_)));
    }

    #[test]
    fn test_fencing_wrong_pid() {
        let m = meta();
        let err = m.check_producer(2000, 0).unwrap_err();
        assert!(matches!(err, GateError::ProducerFenced(_)));
    }

    #[test]
    fn test_epoch_never_decreases_across_bumps() {
        let mut m = meta();
        let mut prev = m.producer_epoch;
        for i in 0..100 {
            let next = m.bump_epoch(i).unwrap();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_epoch_exhaustion() {
        let mut m = meta();
        m.producer_epoch = i16::MAX;
        assert!(m.bump_epoch(1).is_none());
    }

    #[test]
    fn test_timeout_and_expiration() {
        let mut m = meta();
        assert!(!m.is_timed_out(1_000_000)); // Empty never times out

        m.add_participants([TopicId::new("t", 0)], 0).unwrap();
        assert!(!m.is_timed_out(60_000));
        assert!(m.is_timed_out(60_001));

        m.transition_to(TxnState::PrepareAbort, 61_000).unwrap();
        m.transition_to(TxnState::CompleteAbort, 62_000).unwrap();
        assert!(!m.is_expirable(62_000 + 100, 604_800_000));
        assert!(m.is_expirable(62_000 + 604_800_001, 604_800_000));
    }

    #[test]
    fn test_reuse_after_complete() {
        let mut m = meta();
        m.add_participants([TopicId::new("t", 0)], 1).unwrap();
        m.transition_to(TxnState::PrepareCommit, 2).unwrap();
        m.transition_to(TxnState::CompleteCommit, 3).unwrap();
        m.clear_participants();

        // Next transaction on the same id: re-initialisation resets to Empty
        m.transition_to(TxnState::Empty, 3).unwrap();
        m.add_participants([TopicId::new("t", 1)], 4).unwrap();
        assert_eq!(m.state, TxnState::Ongoing);
        assert_eq!(m.participants.len(), 1);
    }
}
