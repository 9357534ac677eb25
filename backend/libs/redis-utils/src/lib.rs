//! Shared Redis plumbing: a pooled connection manager supervised by a
//! background health probe, and named distributed leases.

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

mod lock;

pub use lock::{DistributedLease, LeaseGuard};

/// Shared Redis connection manager guarded by a Tokio mutex.
pub type SharedConnectionManager = Arc<Mutex<ConnectionManager>>;

const PROBE_INTERVAL: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Redis connection pool with a background health supervisor.
///
/// The supervisor PINGs the connection on an interval. That keeps cloud
/// load balancers from dropping the idle connection, and it maintains a
/// health flag callers can read to fail fast while Redis is down instead of
/// stacking command timeouts. `ConnectionManager` reconnects on its own;
/// the flag flips back once a probe gets through.
pub struct RedisPool {
    manager: SharedConnectionManager,
    healthy: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<()>,
    supervisor: JoinHandle<()>,
}

impl RedisPool {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url).context("failed to parse REDIS_URL")?;
        let connection_manager = ConnectionManager::new(client)
            .await
            .context("failed to initialize Redis connection manager")?;

        let manager = Arc::new(Mutex::new(connection_manager));
        let healthy = Arc::new(AtomicBool::new(true));
        let (shutdown_tx, shutdown_rx) = watch::channel(());

        let supervisor = tokio::spawn(supervise(manager.clone(), healthy.clone(), shutdown_rx));
        info!(
            probe_interval_secs = PROBE_INTERVAL.as_secs(),
            "Redis pool connected, health supervisor running"
        );

        Ok(Self {
            manager,
            healthy,
            shutdown_tx,
            supervisor,
        })
    }

    pub fn manager(&self) -> SharedConnectionManager {
        self.manager.clone()
    }

    /// The live health flag, shared with the supervisor.
    pub fn health(&self) -> Arc<AtomicBool> {
        self.healthy.clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }
}

impl Drop for RedisPool {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        self.supervisor.abort();
    }
}

/// Probe loop. Transitions are logged on the edge only, so a long outage is
/// one warning, not one per probe.
async fn supervise(
    manager: SharedConnectionManager,
    healthy: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(PROBE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!("Redis health supervisor shutting down");
                break;
            }
            _ = ticker.tick() => {
                let ok = probe(&manager).await;
                let was = healthy.swap(ok, Ordering::Relaxed);

                match (was, ok) {
                    (true, false) => warn!("Redis unhealthy, dependent callers will fail fast"),
                    (false, true) => info!("Redis recovered"),
                    _ => {}
                }
            }
        }
    }
}

async fn probe(manager: &SharedConnectionManager) -> bool {
    let attempt = timeout(PROBE_TIMEOUT, async {
        let mut conn = manager.lock().await;
        redis::cmd("PING")
            .query_async::<_, String>(&mut *conn)
            .await
    })
    .await;

    match attempt {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!("Redis probe failed: {}", e);
            false
        }
        Err(_) => {
            debug!("Redis probe timed out after {:?}", PROBE_TIMEOUT);
            false
        }
    }
}
