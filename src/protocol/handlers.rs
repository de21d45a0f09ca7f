//! Kafka RPC handlers for the transactional core.
//!
//! One method per RPC, operating on decoded `kafka-protocol` request structs
//! and returning response structs; framing, authentication, and dispatch
//! belong to the embedding broker. Typed errors from the core are translated
//! into Kafka error codes here, per partition where the RPC shape calls for
//! it.

use crate::config::GateConfig;
use crate::consumer::offsets::GroupOffsetStore;
use crate::error::{GateError, KafkaErrorCode, Result};
use crate::partition::log::IsolationLevel;
use crate::partition::registry::PartitionRegistry;
use crate::partition::snapshot::SnapshotBuffer;
use crate::protocol::records::{self, ControlType};
use crate::store::{LogStore, TopicId};
use crate::transaction::coordinator::TransactionCoordinator;
use crate::transaction::log::TxnStateManager;
use crate::transaction::state::TxnState;
use bytes::{Bytes, BytesMut};
use kafka_protocol::messages::ProducerId as KafkaProducerId;
use kafka_protocol::messages::TopicName;
use kafka_protocol::messages::TransactionalId;
use kafka_protocol::messages::{
    AddOffsetsToTxnRequest, AddOffsetsToTxnResponse, AddPartitionsToTxnRequest,
    AddPartitionsToTxnResponse, DescribeProducersRequest, DescribeProducersResponse,
    DescribeTransactionsRequest, DescribeTransactionsResponse, EndTxnRequest, EndTxnResponse,
    FetchRequest, FetchResponse, InitProducerIdRequest, InitProducerIdResponse,
    ListTransactionsRequest, ListTransactionsResponse, ProduceRequest, ProduceResponse,
    TxnOffsetCommitRequest, TxnOffsetCommitResponse, WriteTxnMarkersRequest,
    WriteTxnMarkersResponse,
};
use kafka_protocol::protocol::StrBytes;
use std::sync::Arc;
use tracing::{debug, info, warn};

const NONE: i16 = KafkaErrorCode::None as i16;

fn code(e: &GateError) -> i16 {
    e.kafka_code().code()
}

fn parse_state(name: &str) -> Option<TxnState> {
    match name {
        "Empty" => Some(TxnState::Empty),
        "Ongoing" => Some(TxnState::Ongoing),
        "PrepareCommit" => Some(TxnState::PrepareCommit),
        "PrepareAbort" => Some(TxnState::PrepareAbort),
        "CompleteCommit" => Some(TxnState::CompleteCommit),
        "CompleteAbort" => Some(TxnState::CompleteAbort),
        "Dead" => Some(TxnState::Dead),
        _ => None,
    }
}

/// The Kafka-facing handler for the transactional core.
pub struct GateHandler {
    config: GateConfig,
    registry: Arc<PartitionRegistry>,
    coordinator: Arc<TransactionCoordinator>,
}

impl GateHandler {
    pub fn new(
        config: GateConfig,
        registry: Arc<PartitionRegistry>,
        coordinator: Arc<TransactionCoordinator>,
    ) -> Self {
        Self {
            config,
            registry,
            coordinator,
        }
    }

    /// Assemble the whole transactional core on top of a log store: snapshot
    /// buffer, partition registry, transaction log, and coordinator, with
    /// coordinator state loaded and sweepers running.
    pub async fn bootstrap(
        store: Arc<dyn LogStore>,
        config: GateConfig,
        coordinator_epoch: i32,
    ) -> Result<Self> {
        let snapshots = Arc::new(SnapshotBuffer::new(
            store.clone(),
            config.txn_producer_state_topic_num_partitions,
        ));
        let registry = Arc::new(PartitionRegistry::new(
            store.clone(),
            snapshots,
            config.clone(),
        ));
        let txn_manager = Arc::new(TxnStateManager::new(
            store,
            config.txn_log_topic_num_partitions,
        ));
        let offsets = Arc::new(GroupOffsetStore::new());
        let coordinator = Arc::new(TransactionCoordinator::new(
            config.clone(),
            coordinator_epoch,
            txn_manager,
            registry.clone(),
            offsets,
        ));
        coordinator.load().await?;
        coordinator.start_sweeper();

        Ok(Self::new(config, registry, coordinator))
    }

    pub fn coordinator(&self) -> &Arc<TransactionCoordinator> {
        &self.coordinator
    }

    pub fn registry(&self) -> &Arc<PartitionRegistry> {
        &self.registry
    }

    /// Stop background tasks across the core.
    pub fn shutdown(&self) {
        self.coordinator.shutdown();
        self.registry.shutdown();
    }

    /// Handle InitProducerId request
    pub async fn handle_init_producer_id(
        &self,
        request: InitProducerIdRequest,
    ) -> Result<InitProducerIdResponse> {
        let transactional_id = request.transactional_id.as_ref().map(|s| s.as_str());
        let timeout_ms = if request.transaction_timeout_ms > 0 {
            Some(i64::from(request.transaction_timeout_ms))
        } else {
            None
        };

        info!(
            transactional_id = ?transactional_id,
            transaction_timeout_ms = request.transaction_timeout_ms,
            "InitProducerId request"
        );

        match self
            .coordinator
            .init_producer_id(transactional_id, timeout_ms)
            .await
        {
            Ok((producer_id, producer_epoch)) => Ok(InitProducerIdResponse::default()
                .with_throttle_time_ms(0)
                .with_error_code(NONE)
                .with_producer_id(KafkaProducerId(producer_id))
                .with_producer_epoch(producer_epoch)),
            Err(e) => {
                warn!(error = %e, "InitProducerId failed");
                Ok(InitProducerIdResponse::default()
                    .with_throttle_time_ms(0)
                    .with_error_code(code(&e))
                    .with_producer_id(KafkaProducerId(-1))
                    .with_producer_epoch(-1))
            }
        }
    }

    /// Handle AddPartitionsToTxn request
    pub async fn handle_add_partitions_to_txn(
        &self,
        request: AddPartitionsToTxnRequest,
    ) -> Result<AddPartitionsToTxnResponse> {
        use kafka_protocol::messages::add_partitions_to_txn_response::{
            AddPartitionsToTxnPartitionResult, AddPartitionsToTxnTopicResult,
        };

        let transactional_id = request.v3_and_below_transactional_id.as_str();
        let producer_id = request.v3_and_below_producer_id.0;
        let producer_epoch = request.v3_and_below_producer_epoch;

        info!(
            transactional_id,
            producer_id, producer_epoch, "AddPartitionsToTxn request"
        );

        let partitions: Vec<TopicId> = request
            .v3_and_below_topics
            .iter()
            .flat_map(|topic| {
                topic
                    .partitions
                    .iter()
                    .map(|p| TopicId::new(topic.name.to_string(), *p))
            })
            .collect();

        let per_partition_code = match self
            .coordinator
            .add_partitions_to_txn(transactional_id, producer_id, producer_epoch, partitions)
            .await
        {
            Ok(()) => NONE,
            Err(e) => {
                warn!(error = %e, "AddPartitionsToTxn failed");
                code(&e)
            }
        };

        let results: Vec<AddPartitionsToTxnTopicResult> = request
            .v3_and_below_topics
            .iter()
            .map(|topic| {
                let partition_results: Vec<AddPartitionsToTxnPartitionResult> = topic
                    .partitions
                    .iter()
                    .map(|p| {
                        AddPartitionsToTxnPartitionResult::default()
                            .with_partition_index(*p)
                            .with_partition_error_code(per_partition_code)
                    })
                    .collect();
                AddPartitionsToTxnTopicResult::default()
                    .with_name(topic.name.clone())
                    .with_results_by_partition(partition_results)
            })
            .collect();

        Ok(AddPartitionsToTxnResponse::default()
            .with_throttle_time_ms(0)
            .with_results_by_topic_v3_and_below(results))
    }

    /// Handle AddOffsetsToTxn request
    pub async fn handle_add_offsets_to_txn(
        &self,
        request: AddOffsetsToTxnRequest,
    ) -> Result<AddOffsetsToTxnResponse> {
        let transactional_id = request.transactional_id.as_str();
        let producer_id = request.producer_id.0;
        let producer_epoch = request.producer_epoch;
        let group_id = request.group_id.as_str();

        info!(
            transactional_id,
            producer_id, producer_epoch, group_id, "AddOffsetsToTxn request"
        );

        match self
            .coordinator
            .add_offsets_to_txn(transactional_id, producer_id, producer_epoch, group_id)
            .await
        {
            Ok(_) => Ok(AddOffsetsToTxnResponse::default()
                .with_throttle_time_ms(0)
                .with_error_code(NONE)),
            Err(e) => {
                warn!(error = %e, "AddOffsetsToTxn failed");
                Ok(AddOffsetsToTxnResponse::default()
                    .with_throttle_time_ms(0)
                    .with_error_code(code(&e)))
            }
        }
    }

    /// Handle EndTxn request
    pub async fn handle_end_txn(&self, request: EndTxnRequest) -> Result<EndTxnResponse> {
        let transactional_id = request.transactional_id.as_str();
        let producer_id = request.producer_id.0;
        let producer_epoch = request.producer_epoch;
        let committed = request.committed;

        info!(
            transactional_id,
            producer_id, producer_epoch, committed, "EndTxn request"
        );

        match self
            .coordinator
            .end_txn(transactional_id, producer_id, producer_epoch, committed)
            .await
        {
            Ok(()) => Ok(EndTxnResponse::default()
                .with_throttle_time_ms(0)
                .with_error_code(NONE)),
            Err(e) => {
                warn!(error = %e, "EndTxn failed");
                Ok(EndTxnResponse::default()
                    .with_throttle_time_ms(0)
                    .with_error_code(code(&e)))
            }
        }
    }

    /// Handle TxnOffsetCommit request
    pub async fn handle_txn_offset_commit(
        &self,
        request: TxnOffsetCommitRequest,
    ) -> Result<TxnOffsetCommitResponse> {
        use kafka_protocol::messages::txn_offset_commit_response::{
            TxnOffsetCommitResponsePartition, TxnOffsetCommitResponseTopic,
        };

        let transactional_id = request.transactional_id.as_str();
        let producer_id = request.producer_id.0;
        let producer_epoch = request.producer_epoch;
        let group_id = request.group_id.as_str();

        info!(
            transactional_id,
            producer_id, producer_epoch, group_id, "TxnOffsetCommit request"
        );

        let offsets: Vec<(TopicId, i64, Option<String>)> = request
            .topics
            .iter()
            .flat_map(|topic| {
                topic.partitions.iter().map(|p| {
                    (
                        TopicId::new(topic.name.to_string(), p.partition_index),
                        p.committed_offset,
                        p.committed_metadata.as_ref().map(|m| m.to_string()),
                    )
                })
            })
            .collect();

        let per_partition_code = match self
            .coordinator
            .txn_offset_commit(transactional_id, producer_id, producer_epoch, group_id, offsets)
            .await
        {
            Ok(()) => NONE,
            Err(e) => {
                warn!(error = %e, "TxnOffsetCommit failed");
                code(&e)
            }
        };

        let results: Vec<TxnOffsetCommitResponseTopic> = request
            .topics
            .iter()
            .map(|topic| {
                let partition_results: Vec<TxnOffsetCommitResponsePartition> = topic
                    .partitions
                    .iter()
                    .map(|p| {
                        TxnOffsetCommitResponsePartition::default()
                            .with_partition_index(p.partition_index)
                            .with_error_code(per_partition_code)
                    })
                    .collect();
                TxnOffsetCommitResponseTopic::default()
                    .with_name(topic.name.clone())
                    .with_partitions(partition_results)
            })
            .collect();

        Ok(TxnOffsetCommitResponse::default()
            .with_throttle_time_ms(0)
            .with_topics(results))
    }

    /// Handle WriteTxnMarkers request
    pub async fn handle_write_txn_markers(
        &self,
        request: WriteTxnMarkersRequest,
    ) -> Result<WriteTxnMarkersResponse> {
        use kafka_protocol::messages::write_txn_markers_response::{
            WritableTxnMarkerPartitionResult, WritableTxnMarkerResult, WritableTxnMarkerTopicResult,
        };

        info!(
            markers_count = request.markers.len(),
            "WriteTxnMarkers request"
        );

        let mut results = Vec::new();

        for marker in &request.markers {
            let producer_id = marker.producer_id.0;
            let producer_epoch = marker.producer_epoch;
            let control_type = if marker.transaction_result {
                ControlType::Commit
            } else {
                ControlType::Abort
            };

            let mut topic_results = Vec::new();
            for topic in &marker.topics {
                let mut partition_results = Vec::new();
                for &partition_index in &topic.partition_indexes {
                    let tp = TopicId::new(topic.name.to_string(), partition_index);
                    let error_code = match self.registry.partition(&tp).await {
                        Ok(partition) => match partition
                            .complete_txn(
                                producer_id,
                                producer_epoch,
                                control_type,
                                marker.coordinator_epoch,
                            )
                            .await
                        {
                            Ok(offset) => {
                                debug!(partition = %tp, offset, "transaction marker written");
                                NONE
                            }
                            Err(e) => {
                                warn!(partition = %tp, error = %e, "marker write failed");
                                code(&e)
                            }
                        },
                        Err(e) => code(&e),
                    };
                    partition_results.push(
                        WritableTxnMarkerPartitionResult::default()
                            .with_partition_index(partition_index)
                            .with_error_code(error_code),
                    );
                }
                topic_results.push(
                    WritableTxnMarkerTopicResult::default()
                        .with_name(topic.name.clone())
                        .with_partitions(partition_results),
                );
            }

            results.push(
                WritableTxnMarkerResult::default()
                    .with_producer_id(marker.producer_id)
                    .with_topics(topic_results),
            );
        }

        Ok(WriteTxnMarkersResponse::default().with_markers(results))
    }

    /// Handle Produce request
    pub async fn handle_produce(&self, request: ProduceRequest) -> Result<ProduceResponse> {
        use kafka_protocol::messages::produce_response::{
            PartitionProduceResponse, TopicProduceResponse,
        };

        debug!(
            acks = request.acks,
            timeout_ms = request.timeout_ms,
            "Produce request"
        );

        let mut topic_responses = Vec::new();

        for topic_data in request.topic_data.iter() {
            let topic_name = topic_data.name.as_str().to_string();
            let mut partition_responses = Vec::new();

            for partition_data in topic_data.partition_data.iter() {
                let partition_index = partition_data.index;
                let tp = TopicId::new(topic_name.clone(), partition_index);

                if !self.config.is_topic_allowed(&topic_name) {
                    partition_responses.push(
                        PartitionProduceResponse::default()
                            .with_index(partition_index)
                            .with_error_code(
                                KafkaErrorCode::UnknownTopicOrPartition as i16,
                            )
                            .with_base_offset(-1)
                            .with_log_append_time_ms(-1)
                            .with_log_start_offset(-1),
                    );
                    continue;
                }

                let Some(payload) = partition_data.records.clone() else {
                    partition_responses.push(
                        PartitionProduceResponse::default()
                            .with_index(partition_index)
                            .with_error_code(KafkaErrorCode::UnknownServerError as i16)
                            .with_base_offset(-1),
                    );
                    continue;
                };

                let response = match self.append_to_partition(&tp, payload).await {
                    Ok((base_offset, log_start_offset)) => PartitionProduceResponse::default()
                        .with_index(partition_index)
                        .with_error_code(NONE)
                        .with_base_offset(base_offset)
                        .with_log_append_time_ms(chrono::Utc::now().timestamp_millis())
                        .with_log_start_offset(log_start_offset),
                    // Benign: the batch already landed, answer its offsets
                    Err(GateError::DuplicateSequenceNumber { base_offset, .. }) => {
                        PartitionProduceResponse::default()
                            .with_index(partition_index)
                            .with_error_code(KafkaErrorCode::DuplicateSequenceNumber as i16)
                            .with_base_offset(base_offset)
                            .with_log_append_time_ms(chrono::Utc::now().timestamp_millis())
                            .with_log_start_offset(-1)
                    }
                    Err(e) => {
                        warn!(partition = %tp, error = %e, "produce rejected");
                        PartitionProduceResponse::default()
                            .with_index(partition_index)
                            .with_error_code(code(&e))
                            .with_base_offset(-1)
                            .with_log_append_time_ms(-1)
                            .with_log_start_offset(-1)
                    }
                };
                partition_responses.push(response);
            }

            topic_responses.push(
                TopicProduceResponse::default()
                    .with_name(topic_data.name.clone())
                    .with_partition_responses(partition_responses),
            );
        }

        Ok(ProduceResponse::default()
            .with_responses(topic_responses)
            .with_throttle_time_ms(0))
    }

    async fn append_to_partition(&self, tp: &TopicId, payload: Bytes) -> Result<(i64, i64)> {
        let partition = self.registry.partition(tp).await?;
        let result = partition.append(payload).await?;
        let log_start_offset = partition.fetch_oldest_available_offset().await?;
        Ok((result.base_offset, log_start_offset))
    }

    /// Handle Fetch request
    pub async fn handle_fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
        use kafka_protocol::messages::fetch_response::{
            AbortedTransaction, FetchableTopicResponse, PartitionData,
        };

        let isolation = IsolationLevel::from_i8(request.isolation_level);
        let mut topic_responses = Vec::new();

        for topic in request.topics.iter() {
            let topic_name = topic.topic.as_str().to_string();
            let mut partition_responses = Vec::new();

            for partition in topic.partitions.iter() {
                let partition_index = partition.partition;
                let fetch_offset = partition.fetch_offset;
                let tp = TopicId::new(topic_name.clone(), partition_index);
                let max_batches = (partition.partition_max_bytes / 1024).max(1) as usize;

                debug!(
                    partition = %tp,
                    fetch_offset,
                    isolation = ?isolation,
                    "Fetch request for partition"
                );

                if !self.config.is_topic_allowed(&topic_name) {
                    partition_responses.push(
                        PartitionData::default()
                            .with_partition_index(partition_index)
                            .with_error_code(KafkaErrorCode::UnknownTopicOrPartition as i16)
                            .with_high_watermark(-1),
                    );
                    continue;
                }

                let fetched = match self.registry.partition(&tp).await {
                    Ok(p) => p.fetch(fetch_offset, max_batches, isolation).await,
                    Err(e) => Err(e),
                };

                let partition_data = match fetched {
                    Ok(result) => {
                        let records: Option<Bytes> = if result.batches.is_empty() {
                            None
                        } else {
                            let mut buf = BytesMut::new();
                            for batch in &result.batches {
                                buf.extend_from_slice(&records::with_base_offset(
                                    &batch.payload,
                                    batch.base_offset,
                                ));
                            }
                            Some(buf.freeze())
                        };

                        let aborted: Option<Vec<AbortedTransaction>> =
                            if isolation == IsolationLevel::ReadCommitted {
                                let list: Vec<AbortedTransaction> = result
                                    .aborted_txns
                                    .iter()
                                    .map(|a| {
                                        AbortedTransaction::default()
                                            .with_producer_id(KafkaProducerId(a.producer_id))
                                            .with_first_offset(a.first_offset)
                                    })
                                    .collect();
                                if list.is_empty() {
                                    None
                                } else {
                                    Some(list)
                                }
                            } else {
                                None
                            };

                        PartitionData::default()
                            .with_partition_index(partition_index)
                            .with_error_code(NONE)
                            .with_high_watermark(result.high_watermark)
                            .with_last_stable_offset(result.last_stable_offset)
                            .with_log_start_offset(result.log_start_offset)
                            .with_aborted_transactions(aborted)
                            .with_records(records)
                    }
                    Err(e) => {
                        debug!(partition = %tp, error = %e, "fetch failed");
                        PartitionData::default()
                            .with_partition_index(partition_index)
                            .with_error_code(code(&e))
                            .with_high_watermark(-1)
                    }
                };
                partition_responses.push(partition_data);
            }

            topic_responses.push(
                FetchableTopicResponse::default()
                    .with_topic(TopicName::from(StrBytes::from_string(topic_name)))
                    .with_partitions(partition_responses),
            );
        }

        Ok(FetchResponse::default()
            .with_responses(topic_responses)
            .with_throttle_time_ms(0))
    }

    /// Handle DescribeProducers request
    pub async fn handle_describe_producers(
        &self,
        request: DescribeProducersRequest,
    ) -> Result<DescribeProducersResponse> {
        use kafka_protocol::messages::describe_producers_response::{
            PartitionResponse, ProducerState, TopicResponse,
        };

        info!("DescribeProducers request");

        let mut topic_responses = Vec::new();
        for topic in &request.topics {
            let mut partition_responses = Vec::new();
            for &partition_index in &topic.partition_indexes {
                let tp = TopicId::new(topic.name.to_string(), partition_index);
                let (error_code, producers) = match self.registry.partition(&tp).await {
                    Ok(partition) => {
                        let states: Vec<ProducerState> = partition
                            .producer_entries()
                            .await
                            .into_iter()
                            .map(|entry| {
                                ProducerState::default()
                                    .with_producer_id(KafkaProducerId(entry.producer_id))
                                    .with_producer_epoch(i32::from(entry.producer_epoch))
                                    .with_last_sequence(entry.last_sequence().unwrap_or(-1))
                                    .with_last_timestamp(entry.last_timestamp)
                                    .with_coordinator_epoch(entry.coordinator_epoch)
                                    .with_current_txn_start_offset(
                                        entry.current_txn_first_offset.unwrap_or(-1),
                                    )
                            })
                            .collect();
                        (NONE, states)
                    }
                    Err(e) => (code(&e), vec![]),
                };

                partition_responses.push(
                    PartitionResponse::default()
                        .with_partition_index(partition_index)
                        .with_error_code(error_code)
                        .with_active_producers(producers),
                );
            }
            topic_responses.push(
                TopicResponse::default()
                    .with_name(topic.name.clone())
                    .with_partitions(partition_responses),
            );
        }

        Ok(DescribeProducersResponse::default()
            .with_throttle_time_ms(0)
            .with_topics(topic_responses))
    }

    /// Handle DescribeTransactions request
    pub async fn handle_describe_transactions(
        &self,
        request: DescribeTransactionsRequest,
    ) -> Result<DescribeTransactionsResponse> {
        use kafka_protocol::messages::describe_transactions_response::{
            TopicData, TransactionState,
        };

        info!(
            transactional_ids_count = request.transactional_ids.len(),
            "DescribeTransactions request"
        );

        let mut states = Vec::new();
        for transactional_id in &request.transactional_ids {
            let state = match self.coordinator.describe_transaction(transactional_id.as_str()) {
                Some(meta) => {
                    let mut topic_map: std::collections::HashMap<String, Vec<i32>> =
                        std::collections::HashMap::new();
                    for tp in &meta.participants {
                        topic_map.entry(tp.topic.clone()).or_default().push(tp.partition);
                    }
                    let topics: Vec<TopicData> = topic_map
                        .into_iter()
                        .map(|(topic, partitions)| {
                            TopicData::default()
                                .with_topic(TopicName::from(StrBytes::from_string(topic)))
                                .with_partitions(partitions)
                        })
                        .collect();

                    TransactionState::default()
                        .with_transactional_id(transactional_id.clone())
                        .with_error_code(NONE)
                        .with_transaction_state(StrBytes::from_string(meta.state.to_string()))
                        .with_transaction_timeout_ms(meta.txn_timeout_ms as i32)
                        .with_transaction_start_time_ms(meta.start_time_ms)
                        .with_producer_id(KafkaProducerId(meta.producer_id))
                        .with_producer_epoch(meta.producer_epoch)
                        .with_topics(topics)
                }
                None => TransactionState::default()
                    .with_transactional_id(transactional_id.clone())
                    .with_error_code(KafkaErrorCode::TransactionalIdNotFound as i16),
            };
            states.push(state);
        }

        Ok(DescribeTransactionsResponse::default()
            .with_throttle_time_ms(0)
            .with_transaction_states(states))
    }

    /// Handle ListTransactions request
    pub async fn handle_list_transactions(
        &self,
        request: ListTransactionsRequest,
    ) -> Result<ListTransactionsResponse> {
        use kafka_protocol::messages::list_transactions_response::TransactionState;

        info!("ListTransactions request");

        let state_filters: Vec<TxnState> = request
            .state_filters
            .iter()
            .filter_map(|s| parse_state(s.as_str()))
            .collect();
        let producer_id_filters: Vec<i64> =
            request.producer_id_filters.iter().map(|p| p.0).collect();

        let transactions = self
            .coordinator
            .list_transactions(&state_filters, &producer_id_filters);

        let states: Vec<TransactionState> = transactions
            .into_iter()
            .map(|meta| {
                TransactionState::default()
                    .with_transactional_id(TransactionalId::from(StrBytes::from_string(
                        meta.transactional_id.clone(),
                    )))
                    .with_producer_id(KafkaProducerId(meta.producer_id))
                    .with_transaction_state(StrBytes::from_string(meta.state.to_string()))
            })
            .collect();

        Ok(ListTransactionsResponse::default()
            .with_throttle_time_ms(0)
            .with_error_code(NONE)
            .with_transaction_states(states))
    }
}
