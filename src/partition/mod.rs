//! Partition-side transactional state: producer tables, snapshots, and the
//! log binding that drives them.

pub mod log;
pub mod producer_state;
pub mod registry;
pub mod snapshot;

pub use log::{AppendResult, FetchResult, IsolationLevel, PartitionLog, PartitionState};
pub use producer_state::{
    AbortedTxn, CompletedTxn, OngoingTxn, ProducerEpoch, ProducerId, ProducerStateEntry,
    ProducerStateManager, SequenceCheck, SequenceNumber,
};
pub use registry::PartitionRegistry;
pub use snapshot::{ProducerStateSnapshot, SnapshotBuffer, PRODUCER_SNAPSHOT_TOPIC};
