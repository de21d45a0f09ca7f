//! Configuration for the transactional core
//!
//! All knobs that shape transaction lifetimes, snapshot cadence, and purge
//! behavior live here. Values deserialize from the embedding broker's config
//! file; every field has a production default.

use serde::{Deserialize, Serialize};

fn default_transactional_id_expiration_ms() -> i64 {
    7 * 24 * 60 * 60 * 1000 // 7 days
}

fn default_transaction_max_timeout_ms() -> i64 {
    900_000 // 15 minutes
}

fn default_transaction_default_timeout_ms() -> i64 {
    60_000
}

fn default_snapshot_interval_secs() -> u64 {
    300
}

fn default_purge_interval_secs() -> u64 {
    3600
}

fn default_txn_log_partitions() -> i32 {
    50
}

fn default_producer_state_topic_partitions() -> i32 {
    8
}

fn default_producer_id_expiration_ms() -> i64 {
    24 * 60 * 60 * 1000
}

fn default_max_active_producers() -> usize {
    10_000
}

/// Configuration for the transactional protocol core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// How long a transactional id may sit in a terminal state before it is
    /// forgotten (tombstoned from the transaction log).
    #[serde(default = "default_transactional_id_expiration_ms")]
    pub transactional_id_expiration_ms: i64,

    /// Upper bound on the transaction timeout a client may request.
    /// Requests above it fail with `InvalidTransactionTimeout`.
    #[serde(default = "default_transaction_max_timeout_ms")]
    pub transaction_max_timeout_ms: i64,

    /// Timeout applied when the client does not request one.
    #[serde(default = "default_transaction_default_timeout_ms")]
    pub transaction_default_timeout_ms: i64,

    /// Interval between periodic producer-state snapshots. 0 disables the
    /// periodic task; snapshots can still be taken explicitly.
    #[serde(default = "default_snapshot_interval_secs")]
    pub producer_state_snapshot_interval_secs: u64,

    /// Interval between periodic aborted-transaction purges. 0 disables the
    /// periodic task; purges can still be forced explicitly.
    #[serde(default = "default_purge_interval_secs")]
    pub purge_aborted_txn_interval_secs: u64,

    /// Number of shards (internal transaction-log partitions) the coordinator
    /// hashes transactional ids across.
    #[serde(default = "default_txn_log_partitions")]
    pub txn_log_topic_num_partitions: i32,

    /// Number of partitions of the internal producer-state snapshot topic.
    #[serde(default = "default_producer_state_topic_partitions")]
    pub txn_producer_state_topic_num_partitions: i32,

    /// Idle producer entries older than this are evicted from partition state.
    #[serde(default = "default_producer_id_expiration_ms")]
    pub producer_id_expiration_ms: i64,

    /// Hard cap on tracked producers per partition; oldest idle entries are
    /// evicted first. Entries with an ongoing transaction are never evicted.
    #[serde(default = "default_max_active_producers")]
    pub max_active_producers_per_partition: usize,

    /// Namespaces (topic name prefixes) this bridge serves. Empty allows all.
    #[serde(default)]
    pub allowed_namespaces: Vec<String>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            transactional_id_expiration_ms: default_transactional_id_expiration_ms(),
            transaction_max_timeout_ms: default_transaction_max_timeout_ms(),
            transaction_default_timeout_ms: default_transaction_default_timeout_ms(),
            producer_state_snapshot_interval_secs: default_snapshot_interval_secs(),
            purge_aborted_txn_interval_secs: default_purge_interval_secs(),
            txn_log_topic_num_partitions: default_txn_log_partitions(),
            txn_producer_state_topic_num_partitions: default_producer_state_topic_partitions(),
            producer_id_expiration_ms: default_producer_id_expiration_ms(),
            max_active_producers_per_partition: default_max_active_producers(),
            allowed_namespaces: Vec::new(),
        }
    }
}

impl GateConfig {
    /// Check whether a topic falls inside the allowed namespaces.
    pub fn is_topic_allowed(&self, topic: &str) -> bool {
        if self.allowed_namespaces.is_empty() {
            return true;
        }
        self.allowed_namespaces
            .iter()
            .any(|ns| topic.starts_with(ns.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GateConfig::default();
        assert_eq!(config.transaction_max_timeout_ms, 900_000);
        assert_eq!(config.producer_state_snapshot_interval_secs, 300);
        assert_eq!(config.txn_log_topic_num_partitions, 50);
        assert!(config.allowed_namespaces.is_empty());
    }

    #[test]
    fn test_partial_deserialization_fills_defaults() {
        let config: GateConfig =
            serde_json::from_str(r#"{"transaction_max_timeout_ms": 120000}"#).unwrap();
        assert_eq!(config.transaction_max_timeout_ms, 120_000);
        assert_eq!(config.transaction_default_timeout_ms, 60_000);
    }

    #[test]
    fn test_namespace_filter() {
        let mut config = GateConfig::default();
        assert!(config.is_topic_allowed("any-topic"));

        config.allowed_namespaces = vec!["tenant-a/".to_string()];
        assert!(config.is_topic_allowed("tenant-a/orders"));
        assert!(!config.is_topic_allowed("tenant-b/orders"));
    }
}
