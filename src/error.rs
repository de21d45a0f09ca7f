//! Error types for streamgate
//!
//! This module defines the main error type used throughout the crate and the
//! mapping to Kafka protocol error codes so that clients see the exact codes
//! the Kafka contract requires.

use thiserror::Error;

/// Result type alias for streamgate operations
pub type Result<T> = std::result::Result<T, GateError>;

/// Kafka protocol error codes surfaced by the transactional core
/// See: <https://kafka.apache.org/protocol.html#protocol_error_codes>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum KafkaErrorCode {
    /// No error
    None = 0,
    /// Unknown server error
    UnknownServerError = -1,
    /// The requested offset is outside the range of offsets in the log
    OffsetOutOfRange = 1,
    /// Unknown topic or partition
    UnknownTopicOrPartition = 3,
    /// Coordinator is loading its state and cannot serve requests yet
    CoordinatorLoadInProgress = 14,
    /// This broker is not the coordinator for the transactional id
    NotCoordinator = 16,
    /// Out of order sequence number
    OutOfOrderSequenceNumber = 45,
    /// Duplicate sequence number
    DuplicateSequenceNumber = 46,
    /// Invalid producer epoch
    InvalidProducerEpoch = 47,
    /// Request inconsistent with the current transaction state
    InvalidTxnState = 48,
    /// The producer id does not map to the transactional id
    InvalidProducerIdMapping = 49,
    /// Requested transaction timeout exceeds the broker cap
    InvalidTransactionTimeout = 50,
    /// A completing transaction is still in flight for this transactional id
    ConcurrentTransactions = 51,
    /// A marker was written by a stale coordinator epoch
    TransactionCoordinatorFenced = 52,
    /// Kafka storage error
    KafkaStorageError = 56,
    /// The producer id is not known to this partition
    UnknownProducerId = 59,
    /// The transactional id is not known to the coordinator
    TransactionalIdNotFound = 105,
    /// The producer has been fenced by a newer instance
    ProducerFenced = 90,
}

impl KafkaErrorCode {
    /// Raw wire value of the error code
    pub fn code(self) -> i16 {
        self as i16
    }
}

/// Main error type for streamgate
///
/// Fencing and idempotence outcomes are values, never panics: the produce
/// path matches on these variants and answers with the matching Kafka code.
#[derive(Error, Debug)]
pub enum GateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown topic or partition: {topic}/{partition}")]
    UnknownTopicOrPartition { topic: String, partition: i32 },

    #[error("Offset {0} is out of range")]
    OffsetOutOfRange(i64),

    #[error("Producer fenced: transactional id {0} is owned by a newer producer")]
    ProducerFenced(String),

    #[error("Invalid producer epoch: current {current}, received {received}")]
    InvalidProducerEpoch { current: i16, received: i16 },

    #[error("Duplicate sequence number: batch already appended at offset {base_offset}")]
    DuplicateSequenceNumber { base_offset: i64, last_offset: i64 },

    #[error("Out of order sequence: expected {expected}, received {received}")]
    OutOfOrderSequenceNumber { expected: i32, received: i32 },

    #[error("Invalid transaction state: {0}")]
    InvalidTxnState(String),

    #[error("Producer id {producer_id} does not map to transactional id {transactional_id}")]
    InvalidProducerIdMapping {
        transactional_id: String,
        producer_id: i64,
    },

    #[error("Transaction timeout {requested_ms}ms exceeds the allowed maximum {max_ms}ms")]
    InvalidTransactionTimeout { requested_ms: i64, max_ms: i64 },

    #[error("A previous transaction for {0} is still completing")]
    ConcurrentTransactions(String),

    #[error("Transaction coordinator fenced: coordinator epoch {current} > {received}")]
    TransactionCoordinatorFenced { current: i32, received: i32 },

    #[error("Unknown producer id: {0}")]
    UnknownProducerId(i64),

    #[error("Coordinator shard {0} is still loading")]
    CoordinatorLoadInProgress(i32),

    #[error("Not the coordinator for transactional id {0}")]
    NotCoordinator(String),

    #[error("Partition unavailable: {topic}/{partition} is {state}")]
    PartitionUnavailable {
        topic: String,
        partition: i32,
        state: String,
    },

    #[error("Corrupted snapshot: {0}")]
    CorruptedSnapshot(String),

    #[error("Corrupted record batch: {0}")]
    CorruptedBatch(String),
}

impl GateError {
    /// Create a storage error with operation context
    pub fn storage(operation: &str, detail: impl Into<String>) -> Self {
        GateError::Storage(format!("{}: {}", operation, detail.into()))
    }

    /// Map this error to the Kafka protocol error code clients expect
    pub fn kafka_code(&self) -> KafkaErrorCode {
        match self {
            GateError::UnknownTopicOrPartition { .. } => KafkaErrorCode::UnknownTopicOrPartition,
            GateError::OffsetOutOfRange(_) => KafkaErrorCode::OffsetOutOfRange,
            GateError::ProducerFenced(_) => KafkaErrorCode::ProducerFenced,
            GateError::InvalidProducerEpoch { .. } => KafkaErrorCode::InvalidProducerEpoch,
            GateError::DuplicateSequenceNumber { .. } => KafkaErrorCode::DuplicateSequenceNumber,
            GateError::OutOfOrderSequenceNumber { .. } => {
                KafkaErrorCode::OutOfOrderSequenceNumber
            }
            GateError::InvalidTxnState(_) => KafkaErrorCode::InvalidTxnState,
            GateError::InvalidProducerIdMapping { .. } => {
                KafkaErrorCode::InvalidProducerIdMapping
            }
            GateError::InvalidTransactionTimeout { .. } => {
                KafkaErrorCode::InvalidTransactionTimeout
            }
            GateError::ConcurrentTransactions(_) => KafkaErrorCode::ConcurrentTransactions,
            GateError::TransactionCoordinatorFenced { .. } => {
                KafkaErrorCode::TransactionCoordinatorFenced
            }
            GateError::UnknownProducerId(_) => KafkaErrorCode::UnknownProducerId,
            GateError::CoordinatorLoadInProgress(_) => KafkaErrorCode::CoordinatorLoadInProgress,
            GateError::NotCoordinator(_) => KafkaErrorCode::NotCoordinator,
            GateError::PartitionUnavailable { .. } => KafkaErrorCode::UnknownTopicOrPartition,
            GateError::Storage(_) | GateError::Io(_) => KafkaErrorCode::KafkaStorageError,
            GateError::CorruptedSnapshot(_) | GateError::CorruptedBatch(_) => {
                KafkaErrorCode::UnknownServerError
            }
            GateError::Serialization(_) => KafkaErrorCode::UnknownServerError,
        }
    }
}
