//! Streamgate: the transactional protocol core of a Kafka-compatible broker
//! bridge.
//!
//! The crate provides Kafka exactly-once semantics on top of a foreign
//! append-only log store that knows nothing about Kafka transactions. Three
//! engines carry the contract: the transaction coordinator (producer ids,
//! epochs, two-phase commit), the per-partition producer state manager
//! (idempotence, ongoing and aborted transactions, snapshots), and the
//! partition log binding (recovery, append validation, read-committed
//! fetches, purge).

pub mod config;
pub mod consumer;
pub mod error;
pub mod partition;
pub mod protocol;
pub mod store;
pub mod transaction;

pub use config::GateConfig;
pub use error::{GateError, KafkaErrorCode, Result};
pub use partition::{
    IsolationLevel, PartitionLog, PartitionRegistry, ProducerStateManager, SnapshotBuffer,
};
pub use protocol::{ControlType, GateHandler};
pub use store::{LogStore, MemoryLogStore, StoredBatch, TopicId};
pub use transaction::{TransactionCoordinator, TransactionMetadata, TxnState, TxnStateManager};
