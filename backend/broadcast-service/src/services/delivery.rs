//! Delivery orchestration for one (user, broadcast) pair.
//!
//! `deliver` is idempotent: the PENDING lookup filters out replays, and the
//! conditional status flip means K concurrent calls increment the delivered
//! counter exactly once.

use sqlx::PgPool;
use tracing::{debug, warn};

use crate::config::KafkaConfig;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{BroadcastMessage, DeliveryEventType, MessageDeliveryEvent};
use crate::presence::PresenceStore;
use crate::repository::{BroadcastRepository, StatisticsRepository, UserBroadcastRepository};
use crate::sse::{ConnectionRegistry, SseEvent};
use transactional_outbox::{OutboxEvent, OutboxStore};

pub struct DeliveryService {
    pool: PgPool,
    broadcasts: BroadcastRepository,
    user_broadcasts: UserBroadcastRepository,
    statistics: StatisticsRepository,
    registry: ConnectionRegistry,
    presence: PresenceStore,
    kafka: KafkaConfig,
    pod_id: String,
}

impl DeliveryService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        broadcasts: BroadcastRepository,
        user_broadcasts: UserBroadcastRepository,
        statistics: StatisticsRepository,
        registry: ConnectionRegistry,
        presence: PresenceStore,
        kafka: KafkaConfig,
        pod_id: String,
    ) -> Self {
        Self {
            pool,
            broadcasts,
            user_broadcasts,
            statistics,
            registry,
            presence,
            kafka,
            pod_id,
        }
    }

    /// Deliver one broadcast to one user: push if online, park if not.
    pub async fn deliver(&self, user_id: &str, broadcast_id: i64) -> AppResult<()> {
        let Some(row) = self
            .user_broadcasts
            .find_pending(user_id, broadcast_id)
            .await?
        else {
            // Duplicate CREATED event or a sibling pod got here first.
            debug!(user_id = %user_id, broadcast_id, "No pending row, skipping delivery");
            return Ok(());
        };

        let Some(broadcast) = self.broadcasts.find_by_id(broadcast_id).await? else {
            warn!(broadcast_id, "Pending row references a missing broadcast");
            return Ok(());
        };

        let message = BroadcastMessage {
            user_broadcast_id: row.id,
            broadcast_id,
            content: broadcast.content.clone(),
            sender_name: broadcast.sender_name.clone(),
            priority: broadcast.priority,
            category: broadcast.category.clone(),
            created_at: broadcast.created_at,
        };

        let emitted = self
            .registry
            .emit_to_user(user_id, &SseEvent::Message(message.clone()))
            .await;

        if emitted > 0 {
            let updated = self.user_broadcasts.mark_delivered(row.id).await?;
            if updated == 1 {
                self.statistics.increment_delivered(broadcast_id).await?;
                metrics::inc_messages_delivered();
                debug!(user_id = %user_id, broadcast_id, "Message delivered");
            } else {
                // Another pod's emit won the conditional update.
                debug!(user_id = %user_id, broadcast_id, "Row already delivered elsewhere");
            }
            return Ok(());
        }

        if self.presence.is_online(user_id).await {
            // Online on a sibling pod; its own delivery attempt (or the
            // reconnect replay) completes the flip. Nothing to park.
            debug!(user_id = %user_id, broadcast_id, "User online on another pod, leaving row pending");
            return Ok(());
        }

        // Offline (or vanished between the check and the emit): park the
        // message for the reconnect flush. The PENDING row stays the durable
        // fallback if the cache entry expires first.
        let payload = serde_json::to_string(&message)?;
        if let Err(e) = self
            .presence
            .cache_pending_event(user_id, broadcast_id, &payload)
            .await
        {
            warn!(user_id = %user_id, broadcast_id, "Failed to park pending event: {}", e);
        }

        debug!(user_id = %user_id, broadcast_id, "User offline, event parked for reconnect");
        Ok(())
    }

    /// Reconnect flush: drain the parked cache, then re-deliver every
    /// PENDING row oldest-first. Safe to interrupt and repeat.
    pub async fn flush_pending(&self, user_id: &str) -> AppResult<usize> {
        let parked = match self.presence.take_pending_events(user_id).await {
            Ok(entries) => entries.len(),
            Err(e) => {
                warn!(user_id = %user_id, "Could not drain parked events, DB replay still runs: {}", e);
                0
            }
        };

        let rows = self.user_broadcasts.find_pending_for_user(user_id).await?;
        let mut replayed = 0;

        for row in rows {
            self.deliver(user_id, row.broadcast_id).await?;
            replayed += 1;
        }

        if replayed > 0 || parked > 0 {
            debug!(user_id = %user_id, parked, replayed, "Reconnect replay finished");
        }

        Ok(replayed)
    }

    /// Record a read receipt: flip the row, bump the counter and emit a READ
    /// event so the user's other tabs (on any pod) update too.
    ///
    /// Returns false when the row was already READ (replay).
    pub async fn mark_read(&self, user_id: &str, broadcast_id: i64) -> AppResult<bool> {
        let broadcast = self
            .broadcasts
            .find_by_id(broadcast_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("broadcast {}", broadcast_id)))?;

        let mut tx = self.pool.begin().await?;

        let updated = UserBroadcastRepository::mark_read(&mut tx, broadcast_id, user_id).await?;
        if updated == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        StatisticsRepository::increment_read(&mut tx, broadcast_id).await?;

        let event = MessageDeliveryEvent::new(
            broadcast_id,
            user_id,
            DeliveryEventType::Read,
            &self.pod_id,
            None,
        );
        let outbox_event = OutboxEvent::new(
            self.kafka.topic_for(broadcast.target_type),
            user_id,
            serde_json::to_value(&event)?,
        );
        OutboxStore::insert(&mut tx, &outbox_event).await?;

        tx.commit().await?;
        Ok(true)
    }
}
