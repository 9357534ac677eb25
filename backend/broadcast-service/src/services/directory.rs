//! Client for the external user directory, the authoritative source for the
//! roster and role membership.
//!
//! Every call passes through the [`DirectoryGuard`]: a concurrency cap plus
//! a trip switch fed by a time-bucketed failure count. Once the directory
//! trips, roster lookups fail fast with a typed unavailable error that
//! callers MUST propagate, because delivering to a stale or partial roster
//! is worse than not delivering. After a cooldown the guard lets probe
//! calls through and reopens only after enough of them succeed.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::metrics;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("user directory unavailable: {0}")]
    Unavailable(String),

    #[error("user directory request failed: {0}")]
    Upstream(String),
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Every known user id.
    async fn full_roster(&self) -> Result<Vec<String>, DirectoryError>;

    /// User ids holding the named role.
    async fn role_members(&self, role: &str) -> Result<Vec<String>, DirectoryError>;
}

#[derive(Debug, Deserialize)]
struct RosterResponse {
    user_ids: Vec<String>,
}

pub struct HttpUserDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpUserDirectory {
    pub fn new(base_url: String, request_timeout: Duration) -> Result<Self, DirectoryError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;

        Ok(Self { client, base_url })
    }

    async fn fetch(&self, url: String) -> Result<Vec<String>, DirectoryError> {
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(DirectoryError::Upstream(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }

        let roster: RosterResponse = response
            .json()
            .await
            .map_err(|e| DirectoryError::Upstream(e.to_string()))?;

        Ok(roster.user_ids)
    }
}

#[async_trait]
impl UserDirectory for HttpUserDirectory {
    async fn full_roster(&self) -> Result<Vec<String>, DirectoryError> {
        self.fetch(format!("{}/api/v1/users", self.base_url)).await
    }

    async fn role_members(&self, role: &str) -> Result<Vec<String>, DirectoryError> {
        self.fetch(format!(
            "{}/api/v1/users?role={}",
            self.base_url,
            urlencoding::encode(role)
        ))
        .await
    }
}

#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Failures inside one window that trip the guard
    pub trip_threshold: u32,
    /// Width of the failure-counting window; older failures age out
    pub failure_window: Duration,
    /// How long a tripped guard waits before letting probes through
    pub cooldown: Duration,
    /// Probe successes required to reopen
    pub probe_successes: u32,
    /// Concurrency cap on in-flight directory calls
    pub max_concurrent: usize,
    /// How long a caller waits for a slot before failing fast
    pub max_wait: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            trip_threshold: 5,
            failure_window: Duration::from_secs(30),
            cooldown: Duration::from_secs(30),
            probe_successes: 2,
            max_concurrent: 10,
            max_wait: Duration::from_millis(500),
        }
    }
}

enum GuardState {
    /// Counting failures in the current window
    Serving {
        failures: u32,
        window_started: Instant,
    },
    /// Failing fast until the cooldown passes
    Tripped { since: Instant },
    /// Letting calls through, counting successes toward reopening
    Probing { successes: u32 },
}

const GUARD_SERVING: i64 = 0;
const GUARD_PROBING: i64 = 1;
const GUARD_TRIPPED: i64 = 2;

/// Admission control for the directory: a slot semaphore plus the trip
/// switch. One guard instance serves the whole pod.
struct DirectoryGuard {
    config: GuardConfig,
    slots: Semaphore,
    state: Mutex<GuardState>,
}

impl DirectoryGuard {
    fn new(config: GuardConfig) -> Self {
        metrics::set_directory_guard_state(GUARD_SERVING);
        Self {
            slots: Semaphore::new(config.max_concurrent),
            state: Mutex::new(GuardState::Serving {
                failures: 0,
                window_started: Instant::now(),
            }),
            config,
        }
    }

    /// May this call go out? Flips Tripped → Probing once the cooldown has
    /// passed.
    fn admit(&self) -> Result<(), DirectoryError> {
        let mut state = self.state.lock();

        match *state {
            GuardState::Serving { .. } | GuardState::Probing { .. } => Ok(()),
            GuardState::Tripped { since } => {
                if since.elapsed() >= self.config.cooldown {
                    info!("User directory guard probing after cooldown");
                    *state = GuardState::Probing { successes: 0 };
                    metrics::set_directory_guard_state(GUARD_PROBING);
                    Ok(())
                } else {
                    metrics::inc_directory_rejected("tripped");
                    Err(DirectoryError::Unavailable(
                        "directory guard tripped".to_string(),
                    ))
                }
            }
        }
    }

    fn record_success(&self) {
        let mut state = self.state.lock();

        if let GuardState::Probing { successes } = &mut *state {
            *successes += 1;
            if *successes >= self.config.probe_successes {
                info!("User directory recovered, guard serving again");
                *state = GuardState::Serving {
                    failures: 0,
                    window_started: Instant::now(),
                };
                metrics::set_directory_guard_state(GUARD_SERVING);
            }
        }
    }

    fn record_failure(&self) {
        let mut state = self.state.lock();

        match &mut *state {
            GuardState::Serving {
                failures,
                window_started,
            } => {
                if window_started.elapsed() > self.config.failure_window {
                    *failures = 0;
                    *window_started = Instant::now();
                }
                *failures += 1;

                if *failures >= self.config.trip_threshold {
                    warn!(
                        failures = *failures,
                        window_secs = self.config.failure_window.as_secs(),
                        "User directory guard tripped, refusing roster lookups"
                    );
                    *state = GuardState::Tripped {
                        since: Instant::now(),
                    };
                    metrics::set_directory_guard_state(GUARD_TRIPPED);
                }
            }
            GuardState::Probing { .. } => {
                warn!("User directory probe failed, guard tripped again");
                *state = GuardState::Tripped {
                    since: Instant::now(),
                };
                metrics::set_directory_guard_state(GUARD_TRIPPED);
            }
            GuardState::Tripped { .. } => {}
        }
    }
}

/// The guarded directory client, same method surface as the inner one.
pub struct ResilientDirectory<D> {
    inner: Arc<D>,
    guard: DirectoryGuard,
}

impl<D: UserDirectory + 'static> ResilientDirectory<D> {
    pub fn new(inner: Arc<D>, max_concurrent_calls: usize) -> Self {
        Self::with_config(
            inner,
            GuardConfig {
                max_concurrent: max_concurrent_calls,
                ..GuardConfig::default()
            },
        )
    }

    pub fn with_config(inner: Arc<D>, config: GuardConfig) -> Self {
        Self {
            inner,
            guard: DirectoryGuard::new(config),
        }
    }

    async fn guarded<F, Fut>(&self, f: F) -> Result<Vec<String>, DirectoryError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<String>, DirectoryError>>,
    {
        self.guard.admit()?;

        let permit =
            match tokio::time::timeout(self.guard.config.max_wait, self.guard.slots.acquire())
                .await
            {
                Ok(Ok(permit)) => permit,
                // acquire() only errors on a closed semaphore, which never
                // happens here; the timeout arm is the real saturation case
                Ok(Err(_)) | Err(_) => {
                    metrics::inc_directory_rejected("saturated");
                    warn!(
                        max_concurrent = self.guard.config.max_concurrent,
                        "Directory guard saturated, rejecting call"
                    );
                    return Err(DirectoryError::Unavailable(
                        "directory guard saturated".to_string(),
                    ));
                }
            };

        let result = f().await;
        drop(permit);

        match result {
            Ok(roster) => {
                self.guard.record_success();
                Ok(roster)
            }
            Err(e) => {
                self.guard.record_failure();
                Err(e)
            }
        }
    }
}

#[async_trait]
impl<D: UserDirectory + 'static> UserDirectory for ResilientDirectory<D> {
    async fn full_roster(&self) -> Result<Vec<String>, DirectoryError> {
        self.guarded(|| self.inner.full_roster()).await
    }

    async fn role_members(&self, role: &str) -> Result<Vec<String>, DirectoryError> {
        self.guarded(|| self.inner.role_members(role)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails until `fail_first` calls have happened, then succeeds.
    struct FlakyDirectory {
        calls: AtomicUsize,
        fail_first: usize,
    }

    impl FlakyDirectory {
        fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_first: usize::MAX,
            }
        }

        fn recovering_after(fail_first: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_first,
            }
        }
    }

    #[async_trait]
    impl UserDirectory for FlakyDirectory {
        async fn full_roster(&self) -> Result<Vec<String>, DirectoryError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(DirectoryError::Upstream("boom".to_string()))
            } else {
                Ok(vec!["u1".to_string()])
            }
        }

        async fn role_members(&self, _role: &str) -> Result<Vec<String>, DirectoryError> {
            self.full_roster().await
        }
    }

    fn config() -> GuardConfig {
        GuardConfig {
            trip_threshold: 3,
            failure_window: Duration::from_secs(10),
            cooldown: Duration::from_secs(60),
            probe_successes: 2,
            max_concurrent: 4,
            max_wait: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn trips_after_windowed_failures_and_stops_calling_out() {
        let inner = Arc::new(FlakyDirectory::failing());
        let directory = ResilientDirectory::with_config(inner.clone(), config());

        for _ in 0..3 {
            let _ = directory.full_roster().await;
        }
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);

        // Tripped: fails fast, the directory is not reached
        let result = directory.full_roster().await;
        assert!(matches!(result, Err(DirectoryError::Unavailable(_))));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failures_outside_the_window_age_out() {
        let inner = Arc::new(FlakyDirectory::failing());
        let directory = ResilientDirectory::with_config(
            inner.clone(),
            GuardConfig {
                trip_threshold: 2,
                failure_window: Duration::from_millis(50),
                ..config()
            },
        );

        let _ = directory.full_roster().await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        let _ = directory.full_roster().await;

        // The first failure aged out, so the guard is still serving
        let _ = directory.full_roster().await;
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn reopens_after_cooldown_once_probes_succeed() {
        let inner = Arc::new(FlakyDirectory::recovering_after(3));
        let directory = ResilientDirectory::with_config(
            inner.clone(),
            GuardConfig {
                trip_threshold: 3,
                cooldown: Duration::from_millis(50),
                probe_successes: 2,
                ..config()
            },
        );

        for _ in 0..3 {
            let _ = directory.full_roster().await;
        }
        assert!(matches!(
            directory.full_roster().await,
            Err(DirectoryError::Unavailable(_))
        ));

        tokio::time::sleep(Duration::from_millis(80)).await;

        // Probe calls reach the now-recovered directory and reopen the guard
        assert!(directory.full_roster().await.is_ok());
        assert!(directory.full_roster().await.is_ok());
        assert!(directory.full_roster().await.is_ok());
    }

    #[tokio::test]
    async fn failed_probe_trips_the_guard_again() {
        let inner = Arc::new(FlakyDirectory::failing());
        let directory = ResilientDirectory::with_config(
            inner.clone(),
            GuardConfig {
                trip_threshold: 2,
                cooldown: Duration::from_millis(50),
                ..config()
            },
        );

        for _ in 0..2 {
            let _ = directory.full_roster().await;
        }
        tokio::time::sleep(Duration::from_millis(80)).await;

        // One failed probe re-trips immediately
        let _ = directory.full_roster().await;
        let calls_after_probe = inner.calls.load(Ordering::SeqCst);

        assert!(matches!(
            directory.full_roster().await,
            Err(DirectoryError::Unavailable(_))
        ));
        assert_eq!(inner.calls.load(Ordering::SeqCst), calls_after_probe);
    }

    /// Holds its single slot long enough for a second caller to time out.
    struct SlowDirectory;

    #[async_trait]
    impl UserDirectory for SlowDirectory {
        async fn full_roster(&self) -> Result<Vec<String>, DirectoryError> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(vec![])
        }

        async fn role_members(&self, _role: &str) -> Result<Vec<String>, DirectoryError> {
            self.full_roster().await
        }
    }

    #[tokio::test]
    async fn saturated_guard_rejects_without_queueing() {
        let directory = Arc::new(ResilientDirectory::with_config(
            Arc::new(SlowDirectory),
            GuardConfig {
                max_concurrent: 1,
                max_wait: Duration::from_millis(50),
                ..config()
            },
        ));

        let blocker = {
            let directory = directory.clone();
            tokio::spawn(async move { directory.full_roster().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = directory.full_roster().await;
        assert!(matches!(result, Err(DirectoryError::Unavailable(_))));

        assert!(blocker.await.unwrap().is_ok());
    }

    #[test]
    fn role_names_are_url_encoded() {
        assert_eq!(urlencoding::encode("ops team"), "ops%20team");
        assert_eq!(urlencoding::encode("admin"), "admin");
    }
}
