//! Per-pod registry of live SSE sinks.
//!
//! Each session owns one bounded channel. Emitting is a `try_send`: a full
//! or closed buffer fails only that session, whose id is handed to the close
//! reaper, and never blocks or disturbs sibling tabs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use super::events::SseEvent;

#[derive(Clone)]
pub struct ConnectionRegistry {
    buffer_size: usize,
    /// session_id -> sink
    sinks: Arc<RwLock<HashMap<Uuid, mpsc::Sender<SseEvent>>>>,
    /// user_id -> session ids owned by this pod
    user_sessions: Arc<RwLock<HashMap<String, HashSet<Uuid>>>>,
    /// session_id -> user_id
    session_users: Arc<RwLock<HashMap<Uuid, String>>>,
    /// sessions whose sink failed, awaiting the async close flow
    dead_tx: mpsc::UnboundedSender<Uuid>,
}

impl ConnectionRegistry {
    /// Returns the registry and the receiver of failed session ids; the
    /// connection manager drains it to finish DB/presence cleanup.
    pub fn new(buffer_size: usize) -> (Self, mpsc::UnboundedReceiver<Uuid>) {
        let (dead_tx, dead_rx) = mpsc::unbounded_channel();

        (
            Self {
                buffer_size,
                sinks: Arc::new(RwLock::new(HashMap::new())),
                user_sessions: Arc::new(RwLock::new(HashMap::new())),
                session_users: Arc::new(RwLock::new(HashMap::new())),
                dead_tx,
            },
            dead_rx,
        )
    }

    /// Create a sink for a session and return its receiving end.
    pub async fn register(&self, user_id: &str, session_id: Uuid) -> mpsc::Receiver<SseEvent> {
        let (tx, rx) = mpsc::channel(self.buffer_size);

        self.sinks.write().await.insert(session_id, tx);
        self.user_sessions
            .write()
            .await
            .entry(user_id.to_string())
            .or_default()
            .insert(session_id);
        self.session_users
            .write()
            .await
            .insert(session_id, user_id.to_string());

        tracing::debug!(user_id = %user_id, session_id = %session_id, "SSE sink registered");
        rx
    }

    /// Remove a session from all local maps. Returns the owning user id and
    /// whether this was the user's last session on this pod.
    pub async fn unregister(&self, session_id: Uuid) -> Option<(String, bool)> {
        self.sinks.write().await.remove(&session_id);

        let user_id = self.session_users.write().await.remove(&session_id)?;

        let mut users = self.user_sessions.write().await;
        let last = if let Some(sessions) = users.get_mut(&user_id) {
            sessions.remove(&session_id);
            if sessions.is_empty() {
                users.remove(&user_id);
                true
            } else {
                false
            }
        } else {
            true
        };

        tracing::debug!(user_id = %user_id, session_id = %session_id, last_on_pod = last, "SSE sink removed");
        Some((user_id, last))
    }

    /// Emit to every sink of one user. Returns how many sinks accepted.
    ///
    /// Failed sinks are queued for asynchronous close; siblings are
    /// untouched.
    pub async fn emit_to_user(&self, user_id: &str, event: &SseEvent) -> usize {
        let session_ids: Vec<Uuid> = {
            let users = self.user_sessions.read().await;
            match users.get(user_id) {
                Some(sessions) => sessions.iter().copied().collect(),
                None => return 0,
            }
        };

        self.emit_to_sessions(&session_ids, event).await
    }

    /// Emit to every local sink (heartbeat path).
    pub async fn emit_to_all(&self, event: &SseEvent) -> usize {
        let session_ids: Vec<Uuid> = self.sinks.read().await.keys().copied().collect();
        self.emit_to_sessions(&session_ids, event).await
    }

    async fn emit_to_sessions(&self, session_ids: &[Uuid], event: &SseEvent) -> usize {
        let sinks = self.sinks.read().await;
        let mut delivered = 0;

        for session_id in session_ids {
            let Some(sink) = sinks.get(session_id) else {
                continue;
            };

            match sink.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        session_id = %session_id,
                        event = event.name(),
                        "Sink refused event ({}), scheduling close",
                        if matches!(e, mpsc::error::TrySendError::Full(_)) { "buffer full" } else { "closed" },
                    );
                    let _ = self.dead_tx.send(*session_id);
                }
            }
        }

        delivered
    }

    /// Emit to one specific session (CONNECTED greeting).
    pub async fn emit_to_session(&self, session_id: Uuid, event: &SseEvent) -> bool {
        self.emit_to_sessions(&[session_id], event).await == 1
    }

    /// Does the user have at least one sink on this pod?
    pub async fn is_local(&self, user_id: &str) -> bool {
        self.user_sessions.read().await.contains_key(user_id)
    }

    /// User ids with at least one local session (presence refresh).
    pub async fn local_user_ids(&self) -> Vec<String> {
        self.user_sessions.read().await.keys().cloned().collect()
    }

    pub async fn session_count(&self) -> usize {
        self.sinks.read().await.len()
    }

    pub async fn user_count(&self) -> usize {
        self.user_sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn register_and_count() {
        let (registry, _dead) = ConnectionRegistry::new(8);
        assert_eq!(registry.session_count().await, 0);

        let _rx = registry.register("u1", Uuid::new_v4()).await;
        assert_eq!(registry.session_count().await, 1);
        assert_eq!(registry.user_count().await, 1);
        assert!(registry.is_local("u1").await);
    }

    #[tokio::test]
    async fn multiple_sessions_per_user_all_receive() {
        let (registry, _dead) = ConnectionRegistry::new(8);
        let mut receivers = Vec::new();

        for _ in 0..3 {
            receivers.push(registry.register("u1", Uuid::new_v4()).await);
        }

        let event = SseEvent::MessageRead { broadcast_id: 1 };
        let delivered = registry.emit_to_user("u1", &event).await;
        assert_eq!(delivered, 3);

        for rx in receivers.iter_mut() {
            assert_eq!(rx.recv().await.unwrap(), event);
        }
    }

    #[tokio::test]
    async fn emit_to_unknown_user_is_a_noop() {
        let (registry, _dead) = ConnectionRegistry::new(8);
        let event = SseEvent::MessageRead { broadcast_id: 1 };
        assert_eq!(registry.emit_to_user("nobody", &event).await, 0);
    }

    #[tokio::test]
    async fn unregister_reports_last_session() {
        let (registry, _dead) = ConnectionRegistry::new(8);
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();
        let _rx1 = registry.register("u1", s1).await;
        let _rx2 = registry.register("u1", s2).await;

        let (user, last) = registry.unregister(s1).await.unwrap();
        assert_eq!(user, "u1");
        assert!(!last);

        let (_, last) = registry.unregister(s2).await.unwrap();
        assert!(last);
        assert!(!registry.is_local("u1").await);
    }

    #[tokio::test]
    async fn full_buffer_queues_session_for_close_and_spares_siblings() {
        let (registry, mut dead) = ConnectionRegistry::new(1);
        let stuck = Uuid::new_v4();
        // Receiver kept but never drained, so the 1-slot buffer fills
        let _stuck_rx = registry.register("u1", stuck).await;
        let mut live_rx = registry.register("u1", Uuid::new_v4()).await;

        let event = SseEvent::Heartbeat {
            timestamp: Utc::now(),
        };
        assert_eq!(registry.emit_to_all(&event).await, 2);
        // Second emit overflows the stuck session only
        assert_eq!(registry.emit_to_all(&event).await, 1);

        assert_eq!(dead.recv().await.unwrap(), stuck);
        assert!(live_rx.recv().await.is_some());
    }
}
