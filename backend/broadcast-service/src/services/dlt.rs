//! Dead-letter subsystem: ingest from the `.dlt` topics into Postgres,
//! plus the operator-facing redrive / delete / purge operations.

use chrono::Utc;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::KafkaConfig;
use crate::error::{AppError, AppResult};
use crate::models::{DltRecord, MessageDeliveryEvent};
use crate::repository::DltRepository;

pub struct DltService {
    repository: DltRepository,
    producer: FutureProducer,
    kafka: KafkaConfig,
}

impl DltService {
    pub fn new(repository: DltRepository, producer: FutureProducer, kafka: KafkaConfig) -> Self {
        Self {
            repository,
            producer,
            kafka,
        }
    }

    /// Consume both `.dlt` topics and persist each parked record.
    ///
    /// Unlike the dispatcher, this group is shared across pods: each record
    /// must be persisted exactly once.
    pub async fn run_ingest(&self, mut shutdown: watch::Receiver<()>) {
        let group_id = format!("{}-dlt", self.kafka.group_id);
        let topics = [
            KafkaConfig::dlt_topic(&self.kafka.topic_selected),
            KafkaConfig::dlt_topic(&self.kafka.topic_group),
        ];

        let consumer: StreamConsumer = match ClientConfig::new()
            .set("bootstrap.servers", &self.kafka.brokers)
            .set("group.id", &group_id)
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "false")
            .create()
        {
            Ok(consumer) => consumer,
            Err(e) => {
                error!("Failed to create DLT consumer: {}", e);
                return;
            }
        };

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        if let Err(e) = consumer.subscribe(&topic_refs) {
            error!("Failed to subscribe to DLT topics: {}", e);
            return;
        }

        info!(topics = ?topics, group_id = %group_id, "DLT ingest consuming");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("DLT ingest shutting down");
                    break;
                }
                result = consumer.recv() => {
                    match result {
                        Ok(record) => {
                            match self.persist_record(&record).await {
                                Ok(()) => {
                                    if let Err(e) = consumer.commit_message(&record, CommitMode::Async) {
                                        warn!("DLT offset commit failed: {}", e);
                                    }
                                }
                                Err(e) => {
                                    // No commit: the record is re-ingested.
                                    error!("Failed to persist DLT record: {}", e);
                                }
                            }
                        }
                        Err(e) => warn!("DLT consumer error: {}", e),
                    }
                }
            }
        }
    }

    async fn persist_record(&self, record: &BorrowedMessage<'_>) -> AppResult<()> {
        let Some(payload) = record.payload() else {
            // Tombstone from a purge; nothing to persist.
            return Ok(());
        };

        let header = |name: &str| -> Option<String> {
            record.headers().and_then(|headers| {
                headers
                    .iter()
                    .find(|h| h.key == name)
                    .and_then(|h| h.value)
                    .map(|v| String::from_utf8_lossy(v).into_owned())
            })
        };

        let original_topic = header("dlt-original-topic")
            .unwrap_or_else(|| record.topic().trim_end_matches(".dlt").to_string());
        let original_partition = header("dlt-original-partition")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| record.partition());
        let original_offset = header("dlt-original-offset")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| record.offset());
        let exception_message =
            header("dlt-exception").unwrap_or_else(|| "unknown failure".to_string());

        let dlt_record = DltRecord {
            id: Uuid::new_v4(),
            original_topic,
            original_partition,
            original_offset,
            exception_message,
            payload: payload.to_vec(),
            failed_at: Utc::now(),
        };

        self.repository.insert(&dlt_record).await?;
        info!(
            dlt_id = %dlt_record.id,
            original_topic = %dlt_record.original_topic,
            "DLT record persisted"
        );
        Ok(())
    }

    pub async fn list(&self, limit: i64, offset: i64) -> AppResult<Vec<DltRecord>> {
        self.repository.list(limit, offset).await
    }

    /// Republish a parked record to its original topic, byte-for-byte, and
    /// drop the row. An unparseable payload is unprocessable, not gone.
    pub async fn redrive(&self, id: Uuid) -> AppResult<MessageDeliveryEvent> {
        let record = self
            .repository
            .find_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("dlt record {}", id)))?;

        let event: MessageDeliveryEvent = serde_json::from_slice(&record.payload)
            .map_err(|e| AppError::Unprocessable(format!("payload does not parse: {}", e)))?;

        let kafka_record = FutureRecord::to(&record.original_topic)
            .key(event.user_id.as_str())
            .payload(record.payload.as_slice());

        self.producer
            .send(kafka_record, Duration::from_secs(10))
            .await
            .map_err(|(e, _)| AppError::Kafka(e.to_string()))?;

        self.repository.delete(id).await?;

        info!(dlt_id = %id, topic = %record.original_topic, "DLT record redriven");
        Ok(event)
    }

    /// DB-only removal.
    pub async fn delete(&self, id: Uuid) -> AppResult<()> {
        let deleted = self.repository.delete(id).await?;
        if deleted == 0 {
            return Err(AppError::NotFound(format!("dlt record {}", id)));
        }
        Ok(())
    }

    /// Remove the row AND emit a tombstone on the DLT topic so compaction
    /// drops the parked record from the bus too.
    pub async fn purge(&self, id: Uuid) -> AppResult<()> {
        let record = self
            .repository
            .find_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("dlt record {}", id)))?;

        let dlt_topic = KafkaConfig::dlt_topic(&record.original_topic);
        let key = id.to_string();
        let tombstone: FutureRecord<'_, String, [u8]> = FutureRecord::to(&dlt_topic).key(&key);

        self.producer
            .send(tombstone, Duration::from_secs(10))
            .await
            .map_err(|(e, _)| AppError::Kafka(e.to_string()))?;

        self.repository.delete(id).await?;

        info!(dlt_id = %id, dlt_topic = %dlt_topic, "DLT record purged");
        Ok(())
    }
}
