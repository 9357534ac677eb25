//! Periodic lifecycle jobs. Every job runs on every pod; a named Redis
//! lease makes exactly one pod act per tick, and `FOR UPDATE SKIP LOCKED`
//! on the claimed rows covers the window where a lease expires mid-run.

use chrono::{Duration as ChronoDuration, Utc};
use redis_utils::DistributedLease;
use sqlx::PgPool;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::KafkaConfig;
use crate::error::AppResult;
use crate::models::{BroadcastStatus, DeliveryEventType, MessageDeliveryEvent};
use crate::repository::{BroadcastRepository, SessionRepository, UserBroadcastRepository};
use crate::services::broadcasts::materialize_activation;
use crate::services::TargetingService;
use crate::sse::ConnectionManager;
use transactional_outbox::{OutboxEvent, OutboxStore};

/// Rows claimed per tick by the activation and expiration sweeps.
const BATCH_LIMIT: i64 = 100;

/// Run `job` every `period`, guarded by the named lease.
///
/// A pod that loses the lease race skips the tick. The lease is released on
/// every exit path no earlier than `min_hold`; `max_hold` is the TTL that
/// frees it after a crash.
pub async fn every_with_lease<F, Fut>(
    lease: DistributedLease,
    name: &str,
    min_hold: Duration,
    max_hold: Duration,
    period: Duration,
    mut shutdown: watch::Receiver<()>,
    job: F,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = AppResult<()>>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!(job = name, "Lifecycle job shutting down");
                break;
            }
            _ = ticker.tick() => {
                match lease.try_acquire(name, min_hold, max_hold).await {
                    Ok(Some(guard)) => {
                        if let Err(e) = job().await {
                            warn!(job = name, "Lifecycle job failed, retrying next tick: {}", e);
                        }
                        guard.release().await;
                    }
                    Ok(None) => debug!(job = name, "Another pod holds the lease"),
                    Err(e) => warn!(job = name, "Lease acquisition failed: {}", e),
                }
            }
        }
    }
}

/// Like [`every_with_lease`] but fires once a day at the given UTC hour.
pub async fn daily_with_lease<F, Fut>(
    lease: DistributedLease,
    name: &str,
    hour_utc: u32,
    min_hold: Duration,
    max_hold: Duration,
    mut shutdown: watch::Receiver<()>,
    job: F,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = AppResult<()>>,
{
    loop {
        let now = Utc::now();
        let mut next = now
            .date_naive()
            .and_hms_opt(hour_utc, 0, 0)
            .unwrap_or_else(|| now.naive_utc())
            .and_utc();
        if next <= now {
            next += ChronoDuration::days(1);
        }
        let wait = (next - now).to_std().unwrap_or(Duration::from_secs(60));

        tokio::select! {
            _ = shutdown.changed() => {
                info!(job = name, "Daily job shutting down");
                break;
            }
            _ = tokio::time::sleep(wait) => {
                match lease.try_acquire(name, min_hold, max_hold).await {
                    Ok(Some(guard)) => {
                        if let Err(e) = job().await {
                            warn!(job = name, "Daily job failed, retrying tomorrow: {}", e);
                        }
                        guard.release().await;
                    }
                    Ok(None) => debug!(job = name, "Another pod holds the lease"),
                    Err(e) => warn!(job = name, "Lease acquisition failed: {}", e),
                }
            }
        }
    }
}

pub struct LifecycleController {
    pool: PgPool,
    sessions: SessionRepository,
    targeting: Arc<TargetingService>,
    connections: Arc<ConnectionManager>,
    kafka: KafkaConfig,
    pod_id: String,
}

impl LifecycleController {
    pub fn new(
        pool: PgPool,
        sessions: SessionRepository,
        targeting: Arc<TargetingService>,
        connections: Arc<ConnectionManager>,
        kafka: KafkaConfig,
        pod_id: String,
    ) -> Self {
        Self {
            pool,
            sessions,
            targeting,
            connections,
            kafka,
            pod_id,
        }
    }

    /// Activate due SCHEDULED broadcasts.
    ///
    /// The claim, the status flip, the recipient rows, the statistics seed
    /// and the CREATED outbox events all commit together; a failure (e.g. an
    /// open directory circuit) rolls everything back and the rows stay
    /// SCHEDULED for the next tick.
    pub async fn activate_due_broadcasts(&self) -> AppResult<u64> {
        let mut tx = self.pool.begin().await?;

        let due = BroadcastRepository::claim_due_scheduled(&mut tx, BATCH_LIMIT).await?;
        if due.is_empty() {
            tx.rollback().await?;
            return Ok(0);
        }

        let mut activated = 0;
        for broadcast in &due {
            let recipients = self.targeting.resolve_recipients(broadcast).await?;

            let flipped = BroadcastRepository::update_status(
                &mut tx,
                broadcast.id,
                BroadcastStatus::Scheduled,
                BroadcastStatus::Active,
            )
            .await?;
            if flipped == 0 {
                continue;
            }

            materialize_activation(&mut tx, broadcast, &recipients, &self.kafka, &self.pod_id)
                .await?;

            info!(
                broadcast_id = broadcast.id,
                recipients = recipients.len(),
                "Scheduled broadcast activated"
            );
            activated += 1;
        }

        tx.commit().await?;
        Ok(activated)
    }

    /// Expire ACTIVE broadcasts past their expiry: flip the status, mark the
    /// still-PENDING rows SUPERSEDED and fan out EXPIRED events so connected
    /// clients drop the entry.
    pub async fn expire_due_broadcasts(&self) -> AppResult<u64> {
        let mut tx = self.pool.begin().await?;

        let expiring = BroadcastRepository::claim_expired_active(&mut tx, BATCH_LIMIT).await?;
        if expiring.is_empty() {
            tx.rollback().await?;
            return Ok(0);
        }

        let mut expired = 0;
        for broadcast in &expiring {
            let flipped = BroadcastRepository::update_status(
                &mut tx,
                broadcast.id,
                BroadcastStatus::Active,
                BroadcastStatus::Expired,
            )
            .await?;
            if flipped == 0 {
                continue;
            }

            let superseded =
                UserBroadcastRepository::supersede_pending(&mut tx, broadcast.id).await?;
            let all_users =
                UserBroadcastRepository::user_ids_for_broadcast(&mut tx, broadcast.id).await?;

            let topic = self.kafka.topic_for(broadcast.target_type);
            let mut events = Vec::with_capacity(all_users.len());
            for user_id in &all_users {
                let event = MessageDeliveryEvent::new(
                    broadcast.id,
                    user_id,
                    DeliveryEventType::Expired,
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

            info!(
                broadcast_id = broadcast.id,
                superseded = superseded.len(),
                notified = all_users.len(),
                "Broadcast expired"
            );
            expired += 1;
        }

        tx.commit().await?;
        Ok(expired)
    }

    /// See the connection manager: close dead local sinks, flip stale rows.
    pub async fn cleanup_stale_sessions(&self, threshold: Duration) -> AppResult<u64> {
        self.connections.cleanup_stale_sessions(threshold).await
    }

    /// Hard-delete sessions INACTIVE for longer than the retention window.
    pub async fn purge_old_sessions(&self, retention_days: i64) -> AppResult<u64> {
        let cutoff = Utc::now() - ChronoDuration::days(retention_days);
        let purged = self.sessions.purge_inactive_before(cutoff).await?;
        if purged > 0 {
            info!(purged, "Old inactive sessions purged");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn next_daily_run_is_in_the_future() {
        let now = Utc::now();
        let mut next = now
            .date_naive()
            .and_hms_opt(2, 0, 0)
            .unwrap()
            .and_utc();
        if next <= now {
            next += ChronoDuration::days(1);
        }
        assert!(next > now);
        assert_eq!(next.hour(), 2);
        assert!((next - now) <= ChronoDuration::days(1));
    }
}
