//! The narrow consumer-group subset the transactional core needs.

pub mod offsets;

pub use offsets::{
    offsets_topic_partition, GroupOffsetStore, PendingTxnOffset, CONSUMER_OFFSETS_TOPIC,
};
