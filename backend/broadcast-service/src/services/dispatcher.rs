//! Kafka event dispatcher.
//!
//! One consumer task per core topic. `broadcast-selected` carries SELECTED /
//! ROLE events, `broadcast-group` carries ALL events; the split keeps a huge
//! ALL fan-out from delaying a targeted broadcast. Every pod consumes every
//! record (the group id carries the pod id) so each pod can push to its own
//! local sinks; the conditional delivery update keeps the counters exact.
//!
//! Per-record handling is a pure function of the event type. Retryable
//! failures are retried in place with backoff and no commit; terminal
//! failures (and exhausted retries) route the raw record to `<topic>.dlt`
//! before the offset is committed, so a poison record never blocks its
//! partition.

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::error::AppError;
use crate::metrics;
use crate::models::{DeliveryEventType, MessageDeliveryEvent};
use crate::presence::PresenceStore;
use crate::services::DeliveryService;
use crate::sse::{ConnectionRegistry, SseEvent};

/// Fault-injection marker: a CREATED event whose content contains this is
/// rejected as terminal, exercising the DLT path end to end.
pub const FAIL_ME_SENTINEL: &str = "FAIL_ME";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchErrorKind {
    /// Worth retrying: the dependency may recover
    Retryable,
    /// Never going to succeed: deserialization failure, invariant violation
    Terminal,
}

#[derive(Debug)]
pub struct DispatchError {
    pub kind: DispatchErrorKind,
    pub message: String,
}

impl DispatchError {
    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            kind: DispatchErrorKind::Terminal,
            message: message.into(),
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: DispatchErrorKind::Retryable,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<AppError> for DispatchError {
    fn from(e: AppError) -> Self {
        if e.is_retryable() {
            DispatchError::retryable(e.to_string())
        } else {
            DispatchError::terminal(e.to_string())
        }
    }
}

/// Collaborators the per-record handler needs.
pub struct DispatcherContext {
    pub delivery: Arc<DeliveryService>,
    pub registry: ConnectionRegistry,
    pub presence: PresenceStore,
}

/// Route one event. Pure in the discriminator: CREATED delivers, READ and
/// CANCELLED/EXPIRED push receipts/removals to local sinks.
pub async fn handle_event(
    ctx: &DispatcherContext,
    event: &MessageDeliveryEvent,
) -> Result<(), DispatchError> {
    match event.event_type {
        DeliveryEventType::Created => {
            if event
                .message
                .as_deref()
                .is_some_and(|m| m.contains(FAIL_ME_SENTINEL))
            {
                return Err(DispatchError::terminal(format!(
                    "content contains {} sentinel",
                    FAIL_ME_SENTINEL
                )));
            }

            ctx.delivery
                .deliver(&event.user_id, event.broadcast_id)
                .await
                .map_err(DispatchError::from)
        }
        DeliveryEventType::Read => {
            // Best-effort fan-out of the receipt to the user's other tabs.
            ctx.registry
                .emit_to_user(
                    &event.user_id,
                    &SseEvent::MessageRead {
                        broadcast_id: event.broadcast_id,
                    },
                )
                .await;
            Ok(())
        }
        DeliveryEventType::Cancelled => {
            ctx.registry
                .emit_to_user(
                    &event.user_id,
                    &SseEvent::MessageRemoved {
                        broadcast_id: event.broadcast_id,
                    },
                )
                .await;

            if let Err(e) = ctx
                .presence
                .remove_pending_event(&event.user_id, event.broadcast_id)
                .await
            {
                warn!(user_id = %event.user_id, broadcast_id = event.broadcast_id,
                      "Failed to drop parked event for cancelled broadcast: {}", e);
            }
            Ok(())
        }
        DeliveryEventType::Expired => {
            // The lifecycle job already superseded the rows; only the UI
            // entry needs removing.
            ctx.registry
                .emit_to_user(
                    &event.user_id,
                    &SseEvent::MessageRemoved {
                        broadcast_id: event.broadcast_id,
                    },
                )
                .await;
            Ok(())
        }
    }
}

pub struct Dispatcher {
    kafka: KafkaConfig,
    pod_id: String,
    ctx: DispatcherContext,
    dlt_producer: FutureProducer,
}

impl Dispatcher {
    pub fn new(
        kafka: KafkaConfig,
        pod_id: String,
        ctx: DispatcherContext,
        dlt_producer: FutureProducer,
    ) -> Self {
        Self {
            kafka,
            pod_id,
            ctx,
            dlt_producer,
        }
    }

    /// Consume one topic until shutdown. Spawn once per core topic.
    pub async fn run(&self, topic: String, mut shutdown: watch::Receiver<()>) {
        // Pod-scoped group: every pod sees every record and serves its own
        // sinks. Partition key is the user id, so per-user order holds.
        let group_id = format!("{}-{}", self.kafka.group_id, self.pod_id);

        let consumer: StreamConsumer = match ClientConfig::new()
            .set("bootstrap.servers", &self.kafka.brokers)
            .set("group.id", &group_id)
            .set("auto.offset.reset", "latest")
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", "30000")
            .create()
        {
            Ok(consumer) => consumer,
            Err(e) => {
                error!(topic = %topic, "Failed to create dispatcher consumer: {}", e);
                return;
            }
        };

        if let Err(e) = consumer.subscribe(&[topic.as_str()]) {
            error!(topic = %topic, "Failed to subscribe: {}", e);
            return;
        }

        info!(topic = %topic, group_id = %group_id, "Dispatcher consuming");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!(topic = %topic, "Dispatcher shutting down");
                    break;
                }
                result = consumer.recv() => {
                    match result {
                        Ok(record) => self.process_record(&consumer, &topic, &record).await,
                        Err(e) => {
                            warn!(topic = %topic, "Dispatcher consumer error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn process_record(
        &self,
        consumer: &StreamConsumer,
        topic: &str,
        record: &BorrowedMessage<'_>,
    ) {
        let payload = record.payload().unwrap_or_default();

        let outcome = match serde_json::from_slice::<MessageDeliveryEvent>(payload) {
            Err(e) => Err(DispatchError::terminal(format!(
                "undeserializable record: {}",
                e
            ))),
            Ok(event) => {
                debug!(
                    topic = %topic,
                    event_type = ?event.event_type,
                    broadcast_id = event.broadcast_id,
                    user_id = %event.user_id,
                    "Dispatching event"
                );
                self.handle_with_retries(&event).await
            }
        };

        match outcome {
            Ok(()) => {
                if let Err(e) = consumer.commit_message(record, CommitMode::Async) {
                    warn!(topic = %topic, "Offset commit failed: {}", e);
                }
            }
            Err(e) => {
                error!(topic = %topic, kind = ?e.kind, "Record failed, routing to DLT: {}", e);
                metrics::inc_dispatch_failures();

                match self.route_to_dlt(topic, record, &e).await {
                    Ok(()) => {
                        // Only a parked record unblocks the partition.
                        if let Err(commit_err) = consumer.commit_message(record, CommitMode::Async)
                        {
                            warn!(topic = %topic, "Offset commit failed after DLT: {}", commit_err);
                        }
                    }
                    Err(produce_err) => {
                        // No commit: the record is redelivered and retried.
                        error!(topic = %topic, "DLT produce failed, record will be redelivered: {}", produce_err);
                    }
                }
            }
        }
    }

    /// Retry a failed record up to the configured count before giving it to
    /// the DLT. Terminal failures are retried too (they are what the
    /// fault-injection sentinel produces); only the log level differs.
    async fn handle_with_retries(
        &self,
        event: &MessageDeliveryEvent,
    ) -> Result<(), DispatchError> {
        let max_retries = self.kafka.dispatcher_max_retries;
        let mut attempt = 0u32;

        loop {
            match handle_event(&self.ctx, event).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < max_retries => {
                    attempt += 1;
                    let backoff = Duration::from_millis(
                        self.kafka.dispatcher_retry_backoff_ms * 2u64.pow(attempt - 1),
                    );
                    warn!(
                        event_id = %event.event_id,
                        attempt,
                        kind = ?e.kind,
                        backoff_ms = backoff.as_millis() as u64,
                        "Retrying event: {}", e
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Park the raw record, with provenance headers, on the topic's DLT.
    async fn route_to_dlt(
        &self,
        topic: &str,
        record: &BorrowedMessage<'_>,
        cause: &DispatchError,
    ) -> Result<(), rdkafka::error::KafkaError> {
        let dlt_topic = KafkaConfig::dlt_topic(topic);
        let partition = record.partition().to_string();
        let offset = record.offset().to_string();

        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "dlt-exception",
                value: Some(cause.message.as_bytes()),
            })
            .insert(Header {
                key: "dlt-original-topic",
                value: Some(topic.as_bytes()),
            })
            .insert(Header {
                key: "dlt-original-partition",
                value: Some(partition.as_bytes()),
            })
            .insert(Header {
                key: "dlt-original-offset",
                value: Some(offset.as_bytes()),
            });

        let key = record.key().unwrap_or_default();
        let payload = record.payload().unwrap_or_default();
        let dlt_record = FutureRecord::to(&dlt_topic)
            .key(key)
            .payload(payload)
            .headers(headers);

        self.dlt_producer
            .send(dlt_record, Duration::from_secs(10))
            .await
            .map_err(|(e, _)| e)?;

        info!(dlt_topic = %dlt_topic, "Record parked on DLT");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_errors_map_to_retry_kinds() {
        let retryable: DispatchError = AppError::Database("deadlock".to_string()).into();
        assert_eq!(retryable.kind, DispatchErrorKind::Retryable);

        let terminal: DispatchError = AppError::Validation("bad".to_string()).into();
        assert_eq!(terminal.kind, DispatchErrorKind::Terminal);
    }

    #[test]
    fn sentinel_is_detected_inside_content() {
        let event = MessageDeliveryEvent::new(
            1,
            "u1",
            DeliveryEventType::Created,
            "pod-a",
            Some("please FAIL_ME now".to_string()),
        );
        assert!(event
            .message
            .as_deref()
            .is_some_and(|m| m.contains(FAIL_ME_SENTINEL)));
    }
}
