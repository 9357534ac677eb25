//! Cluster-wide presence and the offline pending-event cache, backed by
//! Redis. All of this state is short-lived and rebuilt from connections and
//! the database after a cold cache loss; failures degrade to the durable
//! path (pending rows replayed on reconnect) instead of erroring the caller
//! where a fallback exists.
//!
//! Commands go through [`PresenceStore::exec`]: while the pool's health
//! supervisor reports Redis down, presence commands fail fast instead of
//! each waiting out its own timeout.

use redis::{AsyncCommands, RedisError};
use redis_utils::{RedisPool, SharedConnectionManager};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::error::{AppError, AppResult};

const ONLINE_USERS_KEY: &str = "online-users";

fn conn_key(user_id: &str) -> String {
    format!("user-conn:{}", user_id)
}

fn pending_key(user_id: &str) -> String {
    format!("pending-evt:{}", user_id)
}

fn stats_key(broadcast_id: i64) -> String {
    format!("broadcast-stats:{}", broadcast_id)
}

#[derive(Clone)]
pub struct PresenceStore {
    redis: SharedConnectionManager,
    healthy: Arc<AtomicBool>,
    command_timeout: Duration,
    presence_ttl: Duration,
    pending_ttl: Duration,
}

impl PresenceStore {
    pub fn new(
        pool: &RedisPool,
        command_timeout: Duration,
        presence_ttl: Duration,
        pending_ttl: Duration,
    ) -> Self {
        Self {
            redis: pool.manager(),
            healthy: pool.health(),
            command_timeout,
            presence_ttl,
            pending_ttl,
        }
    }

    /// Run one presence command: fail fast while Redis is marked unhealthy,
    /// otherwise bound it by the configured timeout.
    async fn exec<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, RedisError>>,
    ) -> Result<T, RedisError> {
        if !self.healthy.load(Ordering::Relaxed) {
            return Err(RedisError::from((
                redis::ErrorKind::IoError,
                "redis marked unhealthy",
            )));
        }

        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    op,
                    timeout_ms = self.command_timeout.as_millis() as u64,
                    "Presence command timed out"
                );
                Err(RedisError::from((
                    redis::ErrorKind::IoError,
                    "presence command timed out",
                )))
            }
        }
    }

    /// Register one more live session for the user.
    ///
    /// The marker is a per-user session counter with a TTL refreshed by the
    /// heartbeat, so a crashed pod's sessions age out on their own.
    pub async fn mark_online(&self, user_id: &str) -> AppResult<()> {
        let key = conn_key(user_id);
        let ttl = self.presence_ttl.as_secs() as i64;
        let redis = self.redis.clone();

        self.exec("mark_online", async {
            let mut conn = redis.lock().await;
            redis::pipe()
                .incr(&key, 1)
                .expire(&key, ttl)
                .sadd(ONLINE_USERS_KEY, user_id)
                .query_async::<_, ()>(&mut *conn)
                .await
        })
        .await?;

        Ok(())
    }

    /// Drop one live session; the user goes offline when the last one ends.
    pub async fn mark_offline(&self, user_id: &str) -> AppResult<()> {
        let key = conn_key(user_id);
        let redis = self.redis.clone();

        let remaining: i64 = self
            .exec("mark_offline", async {
                let mut conn = redis.lock().await;
                conn.decr(&key, 1).await
            })
            .await?;

        if remaining <= 0 {
            self.evict(user_id).await?;
        }

        Ok(())
    }

    /// Remove a user from presence entirely (stale cleanup path).
    pub async fn evict(&self, user_id: &str) -> AppResult<()> {
        let key = conn_key(user_id);
        let redis = self.redis.clone();

        self.exec("evict", async {
            let mut conn = redis.lock().await;
            redis::pipe()
                .del(&key)
                .srem(ONLINE_USERS_KEY, user_id)
                .query_async::<_, ()>(&mut *conn)
                .await
        })
        .await?;

        Ok(())
    }

    /// Refresh presence TTLs for this pod's users (piggybacks on the DB
    /// heartbeat tick).
    pub async fn refresh(&self, user_ids: &[String]) {
        let ttl = self.presence_ttl.as_secs() as i64;

        for user_id in user_ids {
            let key = conn_key(user_id);
            let redis = self.redis.clone();

            let result: Result<(), _> = self
                .exec("refresh", async {
                    let mut conn = redis.lock().await;
                    conn.expire(&key, ttl).await
                })
                .await;

            if let Err(e) = result {
                warn!(user_id = %user_id, "Failed to refresh presence TTL: {}", e);
            }
        }
    }

    /// Does the user have at least one live session anywhere in the cluster?
    ///
    /// A Redis failure (or the unhealthy flag) reads as offline: the message
    /// falls back to the pending path and is replayed on reconnect.
    pub async fn is_online(&self, user_id: &str) -> bool {
        let key = conn_key(user_id);
        let redis = self.redis.clone();

        let result: Result<bool, _> = self
            .exec("is_online", async {
                let mut conn = redis.lock().await;
                conn.exists(&key).await
            })
            .await;

        match result {
            Ok(exists) => exists,
            Err(e) => {
                warn!(user_id = %user_id, "Presence check failed, treating as offline: {}", e);
                false
            }
        }
    }

    pub async fn online_count(&self) -> AppResult<i64> {
        let redis = self.redis.clone();

        let count: i64 = self
            .exec("online_count", async {
                let mut conn = redis.lock().await;
                conn.scard(ONLINE_USERS_KEY).await
            })
            .await?;

        Ok(count)
    }

    /// Park a delivery for an offline user, keyed by broadcast id.
    pub async fn cache_pending_event(
        &self,
        user_id: &str,
        broadcast_id: i64,
        payload: &str,
    ) -> AppResult<()> {
        let key = pending_key(user_id);
        let ttl = self.pending_ttl.as_secs() as i64;
        let redis = self.redis.clone();

        self.exec("cache_pending_event", async {
            let mut conn = redis.lock().await;
            redis::pipe()
                .hset(&key, broadcast_id, payload)
                .expire(&key, ttl)
                .query_async::<_, ()>(&mut *conn)
                .await
        })
        .await?;

        Ok(())
    }

    /// Atomically read and clear the user's parked deliveries.
    pub async fn take_pending_events(&self, user_id: &str) -> AppResult<Vec<(i64, String)>> {
        let key = pending_key(user_id);
        let redis = self.redis.clone();

        let entries: Vec<(i64, String)> = self
            .exec("take_pending_events", async {
                let mut conn = redis.lock().await;
                let entries: Vec<(i64, String)> = conn.hgetall(&key).await?;
                conn.del::<_, ()>(&key).await?;
                Ok(entries)
            })
            .await?;

        Ok(entries)
    }

    /// Drop one parked delivery (broadcast cancelled before reconnect).
    pub async fn remove_pending_event(&self, user_id: &str, broadcast_id: i64) -> AppResult<()> {
        let key = pending_key(user_id);
        let redis = self.redis.clone();

        self.exec("remove_pending_event", async {
            let mut conn = redis.lock().await;
            conn.hdel(&key, broadcast_id).await
        })
        .await
        .map_err(AppError::from)
    }

    /// Read-through cache for per-broadcast statistics.
    pub async fn cache_statistics(&self, broadcast_id: i64, json: &str, ttl: Duration) {
        let key = stats_key(broadcast_id);
        let redis = self.redis.clone();

        let result: Result<(), _> = self
            .exec("cache_statistics", async {
                let mut conn = redis.lock().await;
                conn.set_ex(&key, json, ttl.as_secs()).await
            })
            .await;

        if let Err(e) = result {
            warn!(broadcast_id, "Failed to cache statistics: {}", e);
        }
    }

    pub async fn cached_statistics(&self, broadcast_id: i64) -> Option<String> {
        let key = stats_key(broadcast_id);
        let redis = self.redis.clone();

        let result: Result<Option<String>, _> = self
            .exec("cached_statistics", async {
                let mut conn = redis.lock().await;
                conn.get(&key).await
            })
            .await;

        result.ok().flatten()
    }
}
