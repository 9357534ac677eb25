//! SSE connection management: local sinks, cluster presence, heartbeats,
//! reconnect replay and stale-session cleanup.

mod events;
mod registry;

pub use events::SseEvent;
pub use registry::ConnectionRegistry;

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::ConnectionStats;
use crate::presence::PresenceStore;
use crate::repository::SessionRepository;
use crate::services::DeliveryService;

/// Owns the lifecycle of every SSE connection on this pod.
///
/// Local sinks live in the [`ConnectionRegistry`]; durable session rows and
/// cluster presence are written through so any pod can answer "is this user
/// online".
pub struct ConnectionManager {
    pod_id: String,
    registry: ConnectionRegistry,
    sessions: SessionRepository,
    presence: PresenceStore,
    delivery: Arc<DeliveryService>,
}

impl ConnectionManager {
    pub fn new(
        pod_id: String,
        registry: ConnectionRegistry,
        sessions: SessionRepository,
        presence: PresenceStore,
        delivery: Arc<DeliveryService>,
    ) -> Self {
        Self {
            pod_id,
            registry,
            sessions,
            presence,
            delivery,
        }
    }

    /// Open flow: persist the session, register presence, create the sink,
    /// greet the client and replay anything parked while it was away.
    pub async fn open(
        &self,
        user_id: &str,
        session_id: Option<Uuid>,
    ) -> AppResult<(Uuid, mpsc::Receiver<SseEvent>)> {
        let session_id = session_id.unwrap_or_else(Uuid::new_v4);

        self.sessions
            .upsert_active(user_id, session_id, &self.pod_id)
            .await?;

        if let Err(e) = self.presence.mark_online(user_id).await {
            // Presence is advisory; the DB pending rows still guarantee replay.
            warn!(user_id = %user_id, "Failed to register presence: {}", e);
        }

        let rx = self.registry.register(user_id, session_id).await;
        self.registry
            .emit_to_session(session_id, &SseEvent::Connected { session_id })
            .await;

        // Replay runs off the open path so a slow flush never delays the
        // CONNECTED handshake.
        let delivery = self.delivery.clone();
        let replay_user = user_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = delivery.flush_pending(&replay_user).await {
                warn!(user_id = %replay_user, "Reconnect replay failed: {}", e);
            }
        });

        info!(user_id = %user_id, session_id = %session_id, pod_id = %self.pod_id, "SSE session opened");
        Ok((session_id, rx))
    }

    /// Close flow: drop local maps, close the DB row bound to this pod, and
    /// drop presence when it was the user's last local session.
    pub async fn close(&self, session_id: Uuid) -> AppResult<()> {
        let Some((user_id, last_on_pod)) = self.registry.unregister(session_id).await else {
            return Ok(());
        };

        self.sessions
            .mark_inactive(session_id, &self.pod_id)
            .await?;

        if last_on_pod {
            if let Err(e) = self.presence.mark_offline(&user_id).await {
                warn!(user_id = %user_id, "Failed to drop presence: {}", e);
            }
        }

        info!(user_id = %user_id, session_id = %session_id, "SSE session closed");
        Ok(())
    }

    /// Drain sessions whose sink refused an emit and finish their close
    /// flow asynchronously.
    pub fn spawn_close_reaper(
        self: &Arc<Self>,
        mut dead_rx: mpsc::UnboundedReceiver<Uuid>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(session_id) = dead_rx.recv().await {
                if let Err(e) = manager.close(session_id).await {
                    warn!(session_id = %session_id, "Deferred close failed: {}", e);
                }
            }
        })
    }

    /// Server-push heartbeat: HEARTBEAT to every local sink.
    pub async fn run_push_heartbeat(&self, interval: Duration, mut shutdown: watch::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("Push heartbeat loop shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let event = SseEvent::Heartbeat { timestamp: Utc::now() };
                    let delivered = self.registry.emit_to_all(&event).await;
                    debug!(delivered, "Heartbeat pushed");
                }
            }
        }
    }

    /// DB heartbeat: one batched last_heartbeat update for everything this
    /// pod owns, plus a presence TTL refresh.
    pub async fn run_db_heartbeat(&self, interval: Duration, mut shutdown: watch::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("DB heartbeat loop shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match self.sessions.touch_heartbeats(&self.pod_id).await {
                        Ok(touched) => debug!(touched, "Session heartbeats updated"),
                        Err(e) => warn!("Session heartbeat update failed: {}", e),
                    }

                    let local_users = self.registry.local_user_ids().await;
                    self.presence.refresh(&local_users).await;

                    crate::metrics::set_active_sessions(self.registry.session_count().await);
                }
            }
        }
    }

    /// Stale cleanup: close local sinks for dead sessions, batch-flip every
    /// stale row to INACTIVE and drop their presence.
    pub async fn cleanup_stale_sessions(&self, threshold: Duration) -> AppResult<u64> {
        let cutoff = Utc::now()
            - ChronoDuration::milliseconds(threshold.as_millis() as i64);

        let stale = self.sessions.find_stale(cutoff).await?;
        if stale.is_empty() {
            return Ok(0);
        }

        for session in &stale {
            if session.pod_id == self.pod_id {
                self.registry.unregister(session.session_id).await;
            }
        }

        let ids: Vec<i64> = stale.iter().map(|s| s.id).collect();
        let marked = self.sessions.mark_inactive_by_ids(&ids).await?;

        for session in &stale {
            if let Err(e) = self.presence.mark_offline(&session.user_id).await {
                warn!(user_id = %session.user_id, "Failed to drop stale presence: {}", e);
            }
        }

        info!(stale = stale.len(), marked, "Stale SSE sessions cleaned up");
        Ok(marked)
    }

    pub async fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            pod_id: self.pod_id.clone(),
            local_sessions: self.registry.session_count().await,
            local_users: self.registry.user_count().await,
            cluster_online_users: self.presence.online_count().await.unwrap_or(0),
        }
    }
}
