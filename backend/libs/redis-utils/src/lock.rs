//! Named distributed leases over Redis.
//!
//! A lease is a `SET lock:{name} {token} NX PX {max_hold_ms}` key. Exactly
//! one holder exists at a time; the TTL guarantees release if the holder
//! crashes. Release deletes the key only when the stored token still matches
//! the holder's, so an expired lease taken over by another pod is never
//! clobbered. A minimum hold keeps fast jobs from releasing so quickly that
//! a clock-skewed sibling re-acquires within the same tick.

use crate::SharedConnectionManager;
use redis::RedisError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Lease operations are control-plane traffic; a slow Redis should read as
/// "lease not acquired", not stall the job tick.
const LEASE_IO_TIMEOUT: Duration = Duration::from_secs(2);

/// Compare-and-delete: release only the holder's own token.
const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

async fn timed<T>(
    fut: impl Future<Output = Result<T, RedisError>>,
) -> Result<T, RedisError> {
    match tokio::time::timeout(LEASE_IO_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(RedisError::from((
            redis::ErrorKind::IoError,
            "lease command timed out",
        ))),
    }
}

/// Factory for named leases sharing one Redis connection.
#[derive(Clone)]
pub struct DistributedLease {
    redis: SharedConnectionManager,
}

impl DistributedLease {
    pub fn new(redis: SharedConnectionManager) -> Self {
        Self { redis }
    }

    /// Try to acquire the named lease.
    ///
    /// Returns `Ok(None)` when another holder owns it. The returned guard
    /// must be released with [`LeaseGuard::release`]; if the holder crashes,
    /// the key expires after `max_hold`.
    pub async fn try_acquire(
        &self,
        name: &str,
        min_hold: Duration,
        max_hold: Duration,
    ) -> Result<Option<LeaseGuard>, RedisError> {
        let key = format!("lock:{}", name);
        let token = Uuid::new_v4().to_string();

        let acquired: Option<String> = timed(async {
            let mut conn = self.redis.lock().await;
            redis::cmd("SET")
                .arg(&key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(max_hold.as_millis() as u64)
                .query_async(&mut *conn)
                .await
        })
        .await?;

        if acquired.is_none() {
            debug!(lease = %name, "Lease held elsewhere, skipping");
            return Ok(None);
        }

        debug!(lease = %name, "Lease acquired");
        Ok(Some(LeaseGuard {
            redis: self.redis.clone(),
            key,
            token,
            acquired_at: Instant::now(),
            min_hold,
        }))
    }
}

/// An acquired lease. Holds until [`release`](Self::release) or TTL expiry.
pub struct LeaseGuard {
    redis: SharedConnectionManager,
    key: String,
    token: String,
    acquired_at: Instant,
    min_hold: Duration,
}

impl LeaseGuard {
    /// Release the lease, waiting out the minimum hold first.
    ///
    /// Failure to release is non-fatal: the TTL reclaims the key.
    pub async fn release(self) {
        let held = self.acquired_at.elapsed();
        if held < self.min_hold {
            tokio::time::sleep(self.min_hold - held).await;
        }

        let result: Result<i64, RedisError> = timed(async {
            let mut conn = self.redis.lock().await;
            redis::Script::new(RELEASE_SCRIPT)
                .key(&self.key)
                .arg(&self.token)
                .invoke_async(&mut *conn)
                .await
        })
        .await;

        match result {
            Ok(1) => debug!(lease = %self.key, "Lease released"),
            Ok(_) => debug!(lease = %self.key, "Lease already expired at release"),
            Err(e) => warn!(lease = %self.key, "Lease release failed, TTL will reclaim: {}", e),
        }
    }
}
