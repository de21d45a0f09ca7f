//! End-to-end transaction tests against the in-memory log store: the full
//! producer flow (init, add partitions, produce, commit/abort), read-committed
//! filtering, recovery across unloads and trims, purge, and the admin plane.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use streamgate::protocol::records::{
    decode_batch_records, encode_data_batch, parse_batch_info,
};
use streamgate::{
    GateConfig, GateHandler, IsolationLevel, LogStore, MemoryLogStore, TopicId, TxnState,
};

struct Harness {
    store: Arc<MemoryLogStore>,
    handler: GateHandler,
}

async fn harness() -> Harness {
    harness_with_config(GateConfig::default()).await
}

async fn harness_with_config(config: GateConfig) -> Harness {
    let store = Arc::new(MemoryLogStore::new());
    let handler = GateHandler::bootstrap(store.clone(), config, 0)
        .await
        .unwrap();
    Harness { store, handler }
}

/// A transactional producer session: tracks the assigned pid/epoch and the
/// per-session sequence counter.
struct TestProducer {
    txn_id: String,
    pid: i64,
    epoch: i16,
    seq: i32,
}

impl TestProducer {
    async fn init(h: &Harness, txn_id: &str) -> Self {
        let (pid, epoch) = h
            .handler
            .coordinator()
            .init_producer_id(Some(txn_id), None)
            .await
            .unwrap();
        Self {
            txn_id: txn_id.to_string(),
            pid,
            epoch,
            seq: 0,
        }
    }

    async fn send(
        &mut self,
        h: &Harness,
        tp: &TopicId,
        values: &[&str],
    ) -> streamgate::error::Result<i64> {
        h.handler
            .coordinator()
            .add_partitions_to_txn(&self.txn_id, self.pid, self.epoch, vec![tp.clone()])
            .await?;
        let records: Vec<(Option<&[u8]>, &[u8])> =
            values.iter().map(|v| (None, v.as_bytes())).collect();
        let payload = encode_data_batch(0, self.pid, self.epoch, self.seq, true, &records);
        let partition = h.handler.registry().partition(tp).await?;
        let result = partition.append(payload).await?;
        self.seq += values.len() as i32;
        Ok(result.base_offset)
    }

    async fn commit(&self, h: &Harness) -> streamgate::error::Result<()> {
        h.handler
            .coordinator()
            .end_txn(&self.txn_id, self.pid, self.epoch, true)
            .await
    }

    async fn abort(&self, h: &Harness) -> streamgate::error::Result<()> {
        h.handler
            .coordinator()
            .end_txn(&self.txn_id, self.pid, self.epoch, false)
            .await
    }
}

/// Consume the partition in read-committed mode the way a Kafka client does:
/// batches from transactions in the aborted list are dropped, control batches
/// carry no data.
async fn read_committed_messages(h: &Harness, tp: &TopicId, from: i64) -> Vec<String> {
    let partition = h.handler.registry().partition(tp).await.unwrap();
    let fetched = partition
        .fetch(from, usize::MAX, IsolationLevel::ReadCommitted)
        .await
        .unwrap();

    let mut messages = Vec::new();
    for batch in &fetched.batches {
        let info = parse_batch_info(&batch.payload).unwrap();
        if info.is_control {
            continue;
        }
        let aborted = fetched.aborted_txns.iter().any(|a| {
            a.producer_id == info.producer_id
                && batch.base_offset >= a.first_offset
                && batch.last_offset() <= a.last_offset
        });
        if aborted {
            continue;
        }
        for record in decode_batch_records(&batch.payload).unwrap() {
            let value = record.value.unwrap_or_else(Bytes::new);
            messages.push(String::from_utf8(value.to_vec()).unwrap());
        }
    }
    messages
}

async fn unload_and_reload(h: &Harness, tp: &TopicId) {
    let partition = h.handler.registry().partition(tp).await.unwrap();
    h.store.unload(tp);
    for _ in 0..200 {
        if partition.is_unloaded() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(partition.is_unloaded(), "unload notification never arrived");
    h.store.reload(tp);
}

#[tokio::test]
async fn test_read_committed_filters_aborted_transaction() {
    let h = harness().await;
    let tp = TopicId::new("t", 0);

    let mut producer = TestProducer::init(&h, "X").await;

    // First transaction: two records, aborted (marker lands at offset 2)
    let base = producer.send(&h, &tp, &["abort-0", "abort-1"]).await.unwrap();
    assert_eq!(base, 0);
    producer.abort(&h).await.unwrap();

    // Second transaction: two records, committed (marker at offset 5)
    let base = producer.send(&h, &tp, &["commit-0", "commit-1"]).await.unwrap();
    assert_eq!(base, 3);
    producer.commit(&h).await.unwrap();

    let messages = read_committed_messages(&h, &tp, 0).await;
    assert_eq!(messages, vec!["commit-0", "commit-1"]);

    let partition = h.handler.registry().partition(&tp).await.unwrap();
    let fetched = partition
        .fetch(0, usize::MAX, IsolationLevel::ReadCommitted)
        .await
        .unwrap();
    assert_eq!(fetched.aborted_txns.len(), 1);
    assert_eq!(fetched.aborted_txns[0].producer_id, producer.pid);
    assert_eq!(fetched.aborted_txns[0].first_offset, 0);
    assert!(fetched.last_stable_offset >= 5);
}

#[tokio::test]
async fn test_producer_fenced_by_second_instance() {
    let h = harness().await;
    let tp = TopicId::new("t", 0);

    // First instance opens a transaction and writes
    let mut p1 = TestProducer::init(&h, "X").await;
    p1.send(&h, &tp, &["m"]).await.unwrap();

    // Second instance takes over the transactional id
    let mut p2 = TestProducer::init(&h, "X").await;
    assert_eq!(p2.pid, p1.pid);
    assert!(p2.epoch > p1.epoch);

    // The first instance's commit must be fenced
    let err = p1.commit(&h).await.unwrap_err();
    assert_eq!(
        err.kafka_code(),
        streamgate::KafkaErrorCode::ProducerFenced
    );

    // And its appends are fenced too
    let err = p1.send(&h, &tp, &["zombie"]).await.unwrap_err();
    assert_eq!(
        err.kafka_code(),
        streamgate::KafkaErrorCode::ProducerFenced
    );

    // The new instance commits normally; the reader sees only its record
    p2.send(&h, &tp, &["k"]).await.unwrap();
    p2.commit(&h).await.unwrap();

    let messages = read_committed_messages(&h, &tp, 0).await;
    assert_eq!(messages, vec!["k"]);
}

#[tokio::test]
async fn test_recovery_across_unloads() {
    let h = harness().await;
    let tp = TopicId::new("t", 0);

    let mut producer = TestProducer::init(&h, "recovery").await;
    let mut last_committed = String::new();

    for i in 0..10 {
        let commit = i % 2 == 0;
        let prefix = if commit { "commit" } else { "abort" };
        let values: Vec<String> =
            (0..20).map(|j| format!("{}-txn{}-msg{}", prefix, i, j)).collect();
        let refs: Vec<&str> = values.iter().map(|s| s.as_str()).collect();

        producer.send(&h, &tp, &refs).await.unwrap();
        if commit {
            producer.commit(&h).await.unwrap();
            last_committed = values.last().unwrap().clone();
        } else {
            producer.abort(&h).await.unwrap();
        }

        if (i + 1) % 3 == 0 {
            unload_and_reload(&h, &tp).await;
        }
    }

    let messages = read_committed_messages(&h, &tp, 0).await;
    assert_eq!(messages.len(), 100);
    assert!(messages.iter().all(|m| !m.contains("abort")));
    assert_eq!(messages.last().unwrap(), &last_committed);
}

#[tokio::test]
async fn test_recover_from_invalid_snapshot_after_trim() {
    let h = harness().await;
    let tp = TopicId::new("t", 0);

    let mut producer = TestProducer::init(&h, "trim").await;

    // Committed transaction, then a snapshot covering it (offset 2)
    producer.send(&h, &tp, &["msg1", "msg2"]).await.unwrap();
    producer.commit(&h).await.unwrap();
    let partition = h.handler.registry().partition(&tp).await.unwrap();
    partition.take_producer_snapshot().await.unwrap();

    // A second committed transaction (offsets 3..4), then the store trims
    // past the snapshot, invalidating it
    producer.send(&h, &tp, &["msg3"]).await.unwrap();
    producer.commit(&h).await.unwrap();
    h.store.trim(&tp, 5);

    // New writes land past the trim point
    producer.send(&h, &tp, &["msg4", "msg5"]).await.unwrap();
    producer.commit(&h).await.unwrap();

    // A fresh core over the same store recovers from the post-trim head
    let h2 = Harness {
        store: h.store.clone(),
        handler: GateHandler::bootstrap(h.store.clone(), GateConfig::default(), 1)
            .await
            .unwrap(),
    };
    let messages = read_committed_messages(&h2, &tp, 5).await;
    assert_eq!(messages, vec!["msg4", "msg5"]);

    // After the store trims the remainder, the oldest index follows
    h2.store.trim(&tp, 8);
    let partition = h2.handler.registry().partition(&tp).await.unwrap();
    assert_eq!(partition.fetch_oldest_available_offset().await.unwrap(), 8);
}

#[tokio::test]
async fn test_aborted_txn_purge_after_trim() {
    let h = harness().await;
    let tp = TopicId::new("t", 0);

    // tx1 aborted at offsets 0..2
    let mut p1 = TestProducer::init(&h, "purge-1").await;
    p1.send(&h, &tp, &["a", "b"]).await.unwrap();
    p1.abort(&h).await.unwrap();

    // tx2 committed at offsets 3..4
    let mut p2 = TestProducer::init(&h, "purge-2").await;
    p2.send(&h, &tp, &["c"]).await.unwrap();
    p2.commit(&h).await.unwrap();

    h.store.trim(&tp, 5);

    // Filler commit covering offsets 5..10
    let mut p3 = TestProducer::init(&h, "purge-3").await;
    p3.send(&h, &tp, &["d", "e", "f", "g", "h"]).await.unwrap();
    p3.commit(&h).await.unwrap();

    // tx3 aborted at offsets 11..12, tx4 committed at 13..14
    let mut p4 = TestProducer::init(&h, "purge-4").await;
    p4.send(&h, &tp, &["i"]).await.unwrap();
    p4.abort(&h).await.unwrap();
    let mut p5 = TestProducer::init(&h, "purge-5").await;
    p5.send(&h, &tp, &["j"]).await.unwrap();
    p5.commit(&h).await.unwrap();

    let partition = h.handler.registry().partition(&tp).await.unwrap();
    assert_eq!(partition.aborted_first_offsets().await, vec![0, 11]);

    let purged = partition.force_purge_abort_tx().await.unwrap();
    assert_eq!(purged, 1);
    assert_eq!(partition.aborted_first_offsets().await, vec![11]);
}

#[tokio::test]
async fn test_list_and_describe_transactions() {
    use kafka_protocol::messages::{
        DescribeTransactionsRequest, ListTransactionsRequest, TransactionalId,
    };
    use kafka_protocol::protocol::StrBytes;

    let config = GateConfig::default();
    let configured_timeout = config.transaction_default_timeout_ms;
    let h = harness_with_config(config).await;
    let tp = TopicId::new("t", 0);

    let mut producer = TestProducer::init(&h, "admin-X").await;
    producer.send(&h, &tp, &["v"]).await.unwrap();

    // ListTransactions shows the transaction as Ongoing
    let list = h
        .handler
        .handle_list_transactions(ListTransactionsRequest::default())
        .await
        .unwrap();
    let entry = list
        .transaction_states
        .iter()
        .find(|s| s.transactional_id.as_str() == "admin-X")
        .expect("transaction missing from ListTransactions");
    assert_eq!(entry.transaction_state.as_str(), "Ongoing");

    // DescribeTransactions reports the single participant and the timeout
    let describe = h
        .handler
        .handle_describe_transactions(
            DescribeTransactionsRequest::default().with_transactional_ids(vec![
                TransactionalId::from(StrBytes::from_static_str("admin-X")),
            ]),
        )
        .await
        .unwrap();
    let state = &describe.transaction_states[0];
    assert_eq!(state.error_code, 0);
    assert_eq!(state.transaction_state.as_str(), "Ongoing");
    assert_eq!(i64::from(state.transaction_timeout_ms), configured_timeout);
    assert!(state.producer_epoch >= 0);
    let participants: usize = state.topics.iter().map(|t| t.partitions.len()).sum();
    assert_eq!(participants, 1);

    // After commit: CompleteCommit with no participants
    producer.commit(&h).await.unwrap();
    let meta = h
        .handler
        .coordinator()
        .describe_transaction("admin-X")
        .unwrap();
    assert_eq!(meta.state, TxnState::CompleteCommit);
    assert!(meta.participants.is_empty());
}

#[tokio::test]
async fn test_wire_produce_and_fetch() {
    use kafka_protocol::messages::fetch_request::{FetchPartition, FetchTopic};
    use kafka_protocol::messages::produce_request::{PartitionProduceData, TopicProduceData};
    use kafka_protocol::messages::{FetchRequest, ProduceRequest, TopicName};
    use kafka_protocol::protocol::StrBytes;

    let h = harness().await;

    // Idempotent, non-transactional batch through the wire handler
    let (pid, epoch) = h
        .handler
        .coordinator()
        .init_producer_id(None, None)
        .await
        .unwrap();
    let payload = encode_data_batch(0, pid, epoch, 0, false, &[(None, b"hello")]);

    let request = ProduceRequest::default().with_topic_data(vec![TopicProduceData::default()
        .with_name(TopicName::from(StrBytes::from_static_str("wire")))
        .with_partition_data(vec![PartitionProduceData::default()
            .with_index(0)
            .with_records(Some(payload.clone()))])]);

    let response = h.handler.handle_produce(request).await.unwrap();
    let pr = &response.responses[0].partition_responses[0];
    assert_eq!(pr.error_code, 0);
    assert_eq!(pr.base_offset, 0);

    // A retry of the same batch answers with the original offset
    let retry = ProduceRequest::default().with_topic_data(vec![TopicProduceData::default()
        .with_name(TopicName::from(StrBytes::from_static_str("wire")))
        .with_partition_data(vec![PartitionProduceData::default()
            .with_index(0)
            .with_records(Some(payload))])]);
    let response = h.handler.handle_produce(retry).await.unwrap();
    let pr = &response.responses[0].partition_responses[0];
    assert_eq!(
        pr.error_code,
        streamgate::KafkaErrorCode::DuplicateSequenceNumber as i16
    );
    assert_eq!(pr.base_offset, 0);

    // Fetch it back through the wire handler
    let request = FetchRequest::default()
        .with_isolation_level(0)
        .with_topics(vec![FetchTopic::default()
            .with_topic(TopicName::from(StrBytes::from_static_str("wire")))
            .with_partitions(vec![FetchPartition::default()
                .with_partition(0)
                .with_fetch_offset(0)
                .with_partition_max_bytes(1 << 20)])]);
    let response = h.handler.handle_fetch(request).await.unwrap();
    let pd = &response.responses[0].partitions[0];
    assert_eq!(pd.error_code, 0);
    assert_eq!(pd.high_watermark, 1);

    let records = decode_batch_records(&pd.records.clone().unwrap()).unwrap();
    assert_eq!(records[0].value.as_deref(), Some(b"hello".as_ref()));
}

#[tokio::test]
async fn test_send_offsets_to_transaction() {
    let h = harness().await;
    let tp = TopicId::new("t", 0);

    let mut producer = TestProducer::init(&h, "offsets-X").await;
    producer.send(&h, &tp, &["v"]).await.unwrap();

    h.handler
        .coordinator()
        .add_offsets_to_txn("offsets-X", producer.pid, producer.epoch, "group-1")
        .await
        .unwrap();
    h.handler
        .coordinator()
        .txn_offset_commit(
            "offsets-X",
            producer.pid,
            producer.epoch,
            "group-1",
            vec![(TopicId::new("source", 0), 41, None)],
        )
        .await
        .unwrap();

    producer.commit(&h).await.unwrap();

    // The offsets partition participated: a commit marker reached it
    let offsets_tp = streamgate::consumer::offsets_topic_partition("group-1");
    let hw = h.store.high_watermark(&offsets_tp).await.unwrap();
    assert_eq!(hw, 1);
}

#[tokio::test]
async fn test_recovery_preserves_idempotence_window() {
    let h = harness().await;
    let tp = TopicId::new("t", 0);

    let mut producer = TestProducer::init(&h, "idem").await;
    producer.send(&h, &tp, &["a", "b"]).await.unwrap();
    producer.commit(&h).await.unwrap();

    unload_and_reload(&h, &tp).await;

    // Retrying the committed batch after recovery still answers duplicate
    let payload = encode_data_batch(0, producer.pid, producer.epoch, 0, true, &[
        (None, b"a".as_ref()),
        (None, b"b".as_ref()),
    ]);
    let partition = h.handler.registry().partition(&tp).await.unwrap();
    let err = partition.append(payload).await.unwrap_err();
    match err {
        streamgate::GateError::DuplicateSequenceNumber { base_offset, .. } => {
            assert_eq!(base_offset, 0)
        }
        other => panic!("expected DuplicateSequenceNumber, got {:?}", other),
    }
}
