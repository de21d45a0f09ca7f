//! Transaction coordination: the per-transactional-id state machines, the
//! internal transaction log, and the coordinator that drives two-phase
//! commit against the data partitions.

pub mod coordinator;
pub mod log;
pub mod state;

pub use coordinator::{MarkerWriter, TransactionCoordinator};
pub use log::{TxnStateManager, TXN_LOG_TOPIC};
pub use state::{TransactionMetadata, TxnState};
