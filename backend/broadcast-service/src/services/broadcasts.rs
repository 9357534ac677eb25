//! Admin-side broadcast operations: create (immediate or scheduled), cancel,
//! list, deliveries and statistics.
//!
//! The create path is the canonical outbox write: business rows and the
//! per-recipient CREATED events commit in one transaction, and the drain
//! loop takes it from there.

use chrono::Utc;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use validator::Validate;

use crate::config::KafkaConfig;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{
    Broadcast, BroadcastPriority, BroadcastStatistics, BroadcastStatus, CreateBroadcastRequest,
    DeliveryEventType, MessageDeliveryEvent, TargetType, UserBroadcast,
};
use crate::presence::PresenceStore;
use crate::repository::{
    BroadcastFilter, BroadcastRepository, NewBroadcast, StatisticsRepository,
    UserBroadcastRepository,
};
use crate::services::TargetingService;
use transactional_outbox::{OutboxEvent, OutboxStore};

const STATS_CACHE_TTL: Duration = Duration::from_secs(5);

/// Materialize an activation inside an open transaction: recipient rows,
/// the seeded statistics row and one CREATED outbox event per recipient.
///
/// Shared by the immediate create path and the scheduled activation job.
pub(crate) async fn materialize_activation(
    tx: &mut Transaction<'_, Postgres>,
    broadcast: &Broadcast,
    recipients: &[String],
    kafka: &KafkaConfig,
    pod_id: &str,
) -> AppResult<()> {
    UserBroadcastRepository::insert_batch(tx, broadcast.id, recipients).await?;
    StatisticsRepository::seed(tx, broadcast.id, recipients.len() as i64).await?;

    let topic = kafka.topic_for(broadcast.target_type);
    let mut events = Vec::with_capacity(recipients.len());
    for user_id in recipients {
        let event = MessageDeliveryEvent::new(
            broadcast.id,
            user_id,
            DeliveryEventType::Created,
            pod_id,
            Some(broadcast.content.clone()),
        );
        events.push(OutboxEvent::new(
            topic,
            user_id,
            serde_json::to_value(&event)?,
        ));
    }
    OutboxStore::insert_batch(tx, &events).await?;

    Ok(())
}

pub struct BroadcastService {
    pool: PgPool,
    broadcasts: BroadcastRepository,
    user_broadcasts: UserBroadcastRepository,
    statistics: StatisticsRepository,
    targeting: Arc<TargetingService>,
    presence: PresenceStore,
    kafka: KafkaConfig,
    pod_id: String,
}

impl BroadcastService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        broadcasts: BroadcastRepository,
        user_broadcasts: UserBroadcastRepository,
        statistics: StatisticsRepository,
        targeting: Arc<TargetingService>,
        presence: PresenceStore,
        kafka: KafkaConfig,
        pod_id: String,
    ) -> Self {
        Self {
            pool,
            broadcasts,
            user_broadcasts,
            statistics,
            targeting,
            presence,
            kafka,
            pod_id,
        }
    }

    /// Create a broadcast. A future scheduled_at parks it as SCHEDULED for
    /// the activation job; otherwise it activates in this call.
    pub async fn create(&self, req: CreateBroadcastRequest) -> AppResult<Broadcast> {
        let new = validate_request(req)?;

        if new.status == BroadcastStatus::Scheduled {
            let mut tx = self.pool.begin().await?;
            let broadcast = BroadcastRepository::insert(&mut tx, &new).await?;
            tx.commit().await?;

            info!(broadcast_id = broadcast.id, scheduled_at = ?broadcast.scheduled_at, "Broadcast scheduled");
            metrics::inc_broadcasts_created();
            return Ok(broadcast);
        }

        // Resolve the roster before opening the transaction so the external
        // directory call never holds row locks. A directory failure aborts
        // the creation with an explicit unavailable error.
        let probe = Broadcast {
            id: 0,
            sender_id: new.sender_id.clone(),
            sender_name: new.sender_name.clone(),
            content: new.content.clone(),
            target_type: new.target_type,
            target_ids: new.target_ids.clone(),
            priority: new.priority,
            category: new.category.clone(),
            scheduled_at: new.scheduled_at,
            expires_at: new.expires_at,
            status: BroadcastStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let recipients = self.targeting.resolve_recipients(&probe).await?;

        let mut tx = self.pool.begin().await?;
        let broadcast = BroadcastRepository::insert(&mut tx, &new).await?;
        materialize_activation(&mut tx, &broadcast, &recipients, &self.kafka, &self.pod_id)
            .await?;
        tx.commit().await?;

        info!(
            broadcast_id = broadcast.id,
            recipients = recipients.len(),
            "Broadcast activated"
        );
        metrics::inc_broadcasts_created();
        Ok(broadcast)
    }

    /// Cancel an ACTIVE or SCHEDULED broadcast and fan out CANCELLED events.
    /// Cancelling an already-CANCELLED broadcast is a no-op.
    pub async fn cancel(&self, broadcast_id: i64) -> AppResult<Broadcast> {
        let broadcast = self
            .broadcasts
            .find_by_id(broadcast_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("broadcast {}", broadcast_id)))?;

        match broadcast.status {
            BroadcastStatus::Cancelled => return Ok(broadcast),
            BroadcastStatus::Expired => {
                return Err(AppError::Validation(
                    "an expired broadcast cannot be cancelled".to_string(),
                ))
            }
            BroadcastStatus::Active | BroadcastStatus::Scheduled => {}
        }

        let mut tx = self.pool.begin().await?;

        let updated = BroadcastRepository::cancel(&mut tx, broadcast_id).await?;
        if updated == 0 {
            // Another pod finished the transition first.
            tx.rollback().await?;
            return self
                .broadcasts
                .find_by_id(broadcast_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("broadcast {}", broadcast_id)));
        }

        let user_ids =
            UserBroadcastRepository::user_ids_for_broadcast(&mut tx, broadcast_id).await?;

        let topic = self.kafka.topic_for(broadcast.target_type);
        let mut events = Vec::with_capacity(user_ids.len());
        for user_id in &user_ids {
            let event = MessageDeliveryEvent::new(
                broadcast_id,
                user_id,
                DeliveryEventType::Cancelled,
                &self.pod_id,
                None,
            );
            events.push(OutboxEvent::new(
                topic,
                user_id,
                serde_json::to_value(&event)?,
            ));
        }
        OutboxStore::insert_batch(&mut tx, &events).await?;

        tx.commit().await?;

        info!(broadcast_id, recipients = user_ids.len(), "Broadcast cancelled");
        self.broadcasts
            .find_by_id(broadcast_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("broadcast {}", broadcast_id)))
    }

    pub async fn list(&self, filter: BroadcastFilter, limit: i64) -> AppResult<Vec<Broadcast>> {
        self.broadcasts.list(filter, limit).await
    }

    pub async fn get(&self, broadcast_id: i64) -> AppResult<Broadcast> {
        self.broadcasts
            .find_by_id(broadcast_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("broadcast {}", broadcast_id)))
    }

    pub async fn deliveries(&self, broadcast_id: i64) -> AppResult<Vec<UserBroadcast>> {
        // 404 for an unknown broadcast rather than an empty list
        self.get(broadcast_id).await?;
        self.user_broadcasts.list_for_broadcast(broadcast_id).await
    }

    /// Per-broadcast statistics with a short Redis read-through.
    pub async fn statistics(&self, broadcast_id: i64) -> AppResult<BroadcastStatistics> {
        if let Some(cached) = self.presence.cached_statistics(broadcast_id).await {
            if let Ok(stats) = serde_json::from_str::<BroadcastStatistics>(&cached) {
                return Ok(stats);
            }
        }

        let stats = self
            .statistics
            .get(broadcast_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("statistics for broadcast {}", broadcast_id)))?;

        if let Ok(json) = serde_json::to_string(&stats) {
            self.presence
                .cache_statistics(broadcast_id, &json, STATS_CACHE_TTL)
                .await;
        }

        Ok(stats)
    }
}

/// Request validation; returns the row to insert with its initial status.
fn validate_request(req: CreateBroadcastRequest) -> AppResult<NewBroadcast> {
    req.validate()
        .map_err(|e| AppError::Validation(e.to_string()))?;

    let target_type = TargetType::parse(&req.target_type)
        .ok_or_else(|| AppError::Validation(format!("unknown target type {}", req.target_type)))?;

    match target_type {
        TargetType::Selected if req.target_ids.is_empty() => {
            return Err(AppError::Validation(
                "SELECTED broadcast needs at least one target user".to_string(),
            ));
        }
        TargetType::Role if req.target_ids.first().map_or(true, |r| r.is_empty()) => {
            return Err(AppError::Validation(
                "ROLE broadcast needs a role name".to_string(),
            ));
        }
        _ => {}
    }

    let priority = match &req.priority {
        Some(p) => BroadcastPriority::parse(p)
            .ok_or_else(|| AppError::Validation(format!("unknown priority {}", p)))?,
        None => BroadcastPriority::Normal,
    };

    let now = Utc::now();

    let status = match req.scheduled_at {
        Some(at) if at > now => BroadcastStatus::Scheduled,
        Some(_) => {
            return Err(AppError::Validation(
                "scheduled_at must be in the future".to_string(),
            ));
        }
        None => BroadcastStatus::Active,
    };

    if let Some(expires) = req.expires_at {
        if expires <= now {
            return Err(AppError::Validation(
                "expires_at must be in the future".to_string(),
            ));
        }
        if let Some(scheduled) = req.scheduled_at {
            if expires <= scheduled {
                return Err(AppError::Validation(
                    "expires_at must be after scheduled_at".to_string(),
                ));
            }
        }
    }

    Ok(NewBroadcast {
        sender_id: req.sender_id,
        sender_name: req.sender_name,
        content: req.content,
        target_type,
        target_ids: req.target_ids,
        priority,
        category: req.category.unwrap_or_else(|| "general".to_string()),
        scheduled_at: req.scheduled_at,
        expires_at: req.expires_at,
        status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn request() -> CreateBroadcastRequest {
        CreateBroadcastRequest {
            sender_id: "admin-1".to_string(),
            sender_name: "Admin".to_string(),
            content: "maintenance at noon".to_string(),
            target_type: "ALL".to_string(),
            target_ids: vec![],
            priority: None,
            category: None,
            scheduled_at: None,
            expires_at: None,
        }
    }

    #[test]
    fn immediate_request_becomes_active() {
        let new = validate_request(request()).unwrap();
        assert_eq!(new.status, BroadcastStatus::Active);
        assert_eq!(new.priority, BroadcastPriority::Normal);
        assert_eq!(new.category, "general");
    }

    #[test]
    fn future_schedule_becomes_scheduled() {
        let mut req = request();
        req.scheduled_at = Some(Utc::now() + ChronoDuration::minutes(30));
        let new = validate_request(req).unwrap();
        assert_eq!(new.status, BroadcastStatus::Scheduled);
    }

    #[test]
    fn past_schedule_is_rejected() {
        let mut req = request();
        req.scheduled_at = Some(Utc::now() - ChronoDuration::minutes(1));
        assert!(matches!(
            validate_request(req),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn expired_expiry_is_rejected() {
        let mut req = request();
        req.expires_at = Some(Utc::now() - ChronoDuration::minutes(1));
        assert!(matches!(
            validate_request(req),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn selected_without_targets_is_rejected() {
        let mut req = request();
        req.target_type = "SELECTED".to_string();
        assert!(matches!(
            validate_request(req),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn role_without_name_is_rejected() {
        let mut req = request();
        req.target_type = "ROLE".to_string();
        assert!(matches!(
            validate_request(req),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn empty_content_is_rejected() {
        let mut req = request();
        req.content = String::new();
        assert!(matches!(
            validate_request(req),
            Err(AppError::Validation(_))
        ));
    }
}
