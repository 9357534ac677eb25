//! # Transactional Outbox
//!
//! Couples business writes to event publishing so that no event is lost and
//! none is published for a transaction that never committed.
//!
//! Write path: the caller opens a single sqlx transaction, persists its
//! business rows AND the outbox rows describing what was logically produced,
//! then commits. No broker call happens inside that transaction.
//!
//! Drain path: a background [`OutboxProcessor`] periodically claims a batch
//! of rows with `SELECT ... FOR UPDATE SKIP LOCKED` inside its own
//! transaction, publishes each row to Kafka (topic and partition key come
//! from the row), batch-deletes the claimed rows and commits. Any publish
//! failure rolls the transaction back; the rows unlock and are retried on
//! the next tick. `SKIP LOCKED` is what lets many pods drain concurrently
//! without blocking each other.
//!
//! Crash between publish and delete means duplicates are possible; consumers
//! must be idempotent on their business key.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use transactional_outbox::{OutboxEvent, OutboxStore};
//! use sqlx::PgPool;
//!
//! async fn create_order(pool: &PgPool) -> anyhow::Result<()> {
//!     let mut tx = pool.begin().await?;
//!     // ... business inserts on &mut *tx ...
//!     let event = OutboxEvent::new(
//!         "orders",
//!         "user-42",
//!         serde_json::json!({"order_id": 7}),
//!     );
//!     OutboxStore::insert(&mut tx, &event).await?;
//!     tx.commit().await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

mod error;
pub mod metrics;

pub use error::{OutboxError, OutboxResult};

/// A single row in the `outbox_events` table.
///
/// The row carries everything the drainer needs to publish it: the target
/// topic, the partition key and the serialized payload. Rows are deleted
/// after a successful publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Unique identifier for this event
    pub id: Uuid,

    /// Kafka topic the payload is published to
    pub topic: String,

    /// Kafka partition key; per-key ordering is preserved end to end
    pub event_key: String,

    /// Serialized event payload
    pub payload: serde_json::Value,

    /// Timestamp when the row was committed
    pub created_at: DateTime<Utc>,
}

impl OutboxEvent {
    pub fn new(topic: &str, event_key: &str, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.to_string(),
            event_key: event_key.to_string(),
            payload,
            created_at: Utc::now(),
        }
    }
}

/// SQL access to the outbox table.
///
/// All mutating operations take an open transaction: inserts so the caller
/// can couple them to its business writes, claim/delete so the drainer holds
/// the row locks until it commits or rolls back.
pub struct OutboxStore;

impl OutboxStore {
    /// Insert one event inside the caller's transaction.
    pub async fn insert(
        tx: &mut Transaction<'_, Postgres>,
        event: &OutboxEvent,
    ) -> OutboxResult<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_events (id, topic, event_key, payload, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(event.id)
        .bind(&event.topic)
        .bind(&event.event_key)
        .bind(&event.payload)
        .bind(event.created_at)
        .execute(&mut **tx)
        .await?;

        debug!(event_id = %event.id, topic = %event.topic, "Event inserted into outbox");
        Ok(())
    }

    /// Insert a batch of events inside the caller's transaction.
    pub async fn insert_batch(
        tx: &mut Transaction<'_, Postgres>,
        events: &[OutboxEvent],
    ) -> OutboxResult<()> {
        for event in events {
            Self::insert(tx, event).await?;
        }
        Ok(())
    }

    /// Claim up to `limit` rows for draining.
    ///
    /// Rows are locked for the lifetime of `tx`; rows already locked by a
    /// sibling pod are skipped rather than waited on.
    pub async fn claim(
        tx: &mut Transaction<'_, Postgres>,
        limit: i64,
    ) -> OutboxResult<Vec<OutboxEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, topic, event_key, payload, created_at
            FROM outbox_events
            ORDER BY created_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(limit)
        .fetch_all(&mut **tx)
        .await?;

        let events = rows
            .into_iter()
            .map(|row| {
                Ok(OutboxEvent {
                    id: row.try_get("id")?,
                    topic: row.try_get("topic")?,
                    event_key: row.try_get("event_key")?,
                    payload: row.try_get("payload")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        Ok(events)
    }

    /// Delete the claimed rows. Called only after every publish succeeded.
    pub async fn delete(
        tx: &mut Transaction<'_, Postgres>,
        ids: &[Uuid],
    ) -> OutboxResult<u64> {
        let result = sqlx::query("DELETE FROM outbox_events WHERE id = ANY($1)")
            .bind(ids)
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected())
    }

    /// Pending row count and oldest pending age in seconds (0 when empty).
    pub async fn pending_stats(pool: &PgPool) -> OutboxResult<(i64, i64)> {
        let rec = sqlx::query(
            r#"
            SELECT
                COUNT(*)::BIGINT AS pending,
                COALESCE(EXTRACT(EPOCH FROM (NOW() - MIN(created_at)))::BIGINT, 0) AS age_seconds
            FROM outbox_events
            "#,
        )
        .fetch_one(pool)
        .await?;

        let pending: i64 = rec.try_get("pending").unwrap_or(0);
        let age: i64 = rec.try_get("age_seconds").unwrap_or(0);
        Ok((pending, age))
    }
}

/// Publisher seam so the drain loop can be exercised without a broker.
#[async_trait]
pub trait OutboxPublisher: Send + Sync {
    async fn publish(&self, event: &OutboxEvent) -> OutboxResult<()>;
}

/// Kafka publisher.
///
/// The producer MUST be configured with `enable.idempotence=true` and
/// `acks=all`; the partition key is the row's `event_key`.
pub struct KafkaOutboxPublisher {
    producer: FutureProducer,
    delivery_timeout: Duration,
}

impl KafkaOutboxPublisher {
    pub fn new(producer: FutureProducer) -> Self {
        Self {
            producer,
            delivery_timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl OutboxPublisher for KafkaOutboxPublisher {
    async fn publish(&self, event: &OutboxEvent) -> OutboxResult<()> {
        let payload = serde_json::to_string(&event.payload)?;

        let record = FutureRecord::to(&event.topic)
            .key(&event.event_key)
            .payload(&payload);

        self.producer
            .send(record, self.delivery_timeout)
            .await
            .map_err(|(err, _)| OutboxError::PublishFailed(err.to_string()))?;

        debug!(event_id = %event.id, topic = %event.topic, "Outbox event published");
        Ok(())
    }
}

/// Background drainer.
///
/// Claims, publishes and deletes rows in one transaction per tick. The whole
/// batch commits or none of it does, so a Kafka outage leaves every row in
/// place for the next tick.
pub struct OutboxProcessor<P: OutboxPublisher> {
    pool: PgPool,
    publisher: Arc<P>,
    batch_size: i64,
    poll_interval: Duration,
    metrics: Option<metrics::OutboxMetrics>,
}

impl<P: OutboxPublisher> OutboxProcessor<P> {
    pub fn new(pool: PgPool, publisher: Arc<P>, batch_size: i64, poll_interval: Duration) -> Self {
        Self {
            pool,
            publisher,
            batch_size,
            poll_interval,
            metrics: None,
        }
    }

    /// Attach Prometheus gauges updated once per tick.
    pub fn with_metrics(mut self, metrics: metrics::OutboxMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run until `shutdown` fires. Spawn as a background task.
    pub async fn run(&self, mut shutdown: watch::Receiver<()>) {
        info!(
            batch_size = self.batch_size,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Outbox processor starting"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Outbox processor shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.poll_interval) => {
                    match self.drain_once().await {
                        Ok(0) => debug!("No outbox events to publish"),
                        Ok(count) => info!(published_count = count, "Published events from outbox"),
                        Err(e) => error!(error = ?e, "Outbox drain failed, batch rolled back"),
                    }

                    if let Some(metrics) = &self.metrics {
                        if let Ok((pending, age)) = OutboxStore::pending_stats(&self.pool).await {
                            metrics.pending.set(pending);
                            metrics.oldest_pending_age_seconds.set(age);
                        }
                    }
                }
            }
        }
    }

    /// Drain a single batch. Returns the number of published-and-deleted rows.
    pub async fn drain_once(&self) -> OutboxResult<usize> {
        let mut tx = self.pool.begin().await?;

        let events = OutboxStore::claim(&mut tx, self.batch_size).await?;
        if events.is_empty() {
            tx.rollback().await?;
            return Ok(0);
        }

        for event in &events {
            // Any failure drops `tx`, rolling back the claim.
            self.publisher.publish(event).await?;
        }

        let ids: Vec<Uuid> = events.iter().map(|e| e.id).collect();
        OutboxStore::delete(&mut tx, &ids).await?;
        tx.commit().await?;

        if let Some(metrics) = &self.metrics {
            metrics.published.inc_by(events.len() as u64);
        }

        Ok(events.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbox_event_carries_topic_and_key() {
        let event = OutboxEvent::new(
            "broadcast-selected",
            "user-17",
            serde_json::json!({"broadcast_id": 3}),
        );

        assert_eq!(event.topic, "broadcast-selected");
        assert_eq!(event.event_key, "user-17");
        assert_eq!(event.payload["broadcast_id"], 3);
        assert!(!event.id.is_nil());
    }

    #[test]
    fn distinct_events_get_distinct_ids() {
        let a = OutboxEvent::new("t", "k", serde_json::json!({}));
        let b = OutboxEvent::new("t", "k", serde_json::json!({}));
        assert_ne!(a.id, b.id);
    }
}
