use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub kafka: KafkaConfig,
    pub outbox: OutboxConfig,
    pub sse: SseConfig,
    pub lifecycle: LifecycleConfig,
    pub directory: DirectoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub env: String,
    pub port: u16,
    /// Identity of this instance; sessions and delivery events carry it
    pub pod_id: String,
    /// Admin create-broadcast guard, requests per minute
    pub create_rate_per_minute: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    /// Upper bound on one presence/cache command
    pub command_timeout_ms: u64,
    /// TTL for the per-user pending-event cache in seconds
    pub pending_event_ttl_secs: u64,
    /// TTL for the per-user presence marker in seconds
    pub presence_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    pub brokers: String,
    pub group_id: String,
    /// SELECTED / ROLE broadcasts (small fan-out, latency-sensitive)
    pub topic_selected: String,
    /// ALL broadcasts (large fan-out, throughput-oriented)
    pub topic_group: String,
    /// In-process delivery attempts before a record goes to the DLT
    pub dispatcher_max_retries: u32,
    pub dispatcher_retry_backoff_ms: u64,
}

impl KafkaConfig {
    pub fn dlt_topic(topic: &str) -> String {
        format!("{}.dlt", topic)
    }

    /// Which core topic a broadcast's events go to.
    pub fn topic_for(&self, target_type: crate::models::TargetType) -> &str {
        match target_type {
            crate::models::TargetType::All => &self.topic_group,
            _ => &self.topic_selected,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    pub poll_interval_ms: u64,
    pub batch_size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SseConfig {
    /// Server-push and DB heartbeat period in milliseconds
    pub heartbeat_interval_ms: u64,
    /// Per-session sink buffer; a full buffer closes that session
    pub channel_buffer: usize,
}

impl SseConfig {
    /// Sessions whose heartbeat is older than this are stale.
    pub fn stale_threshold_ms(&self) -> u64 {
        self.heartbeat_interval_ms * 3
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    pub activation_interval_secs: u64,
    pub expiration_interval_secs: u64,
    pub session_cleanup_interval_secs: u64,
    /// INACTIVE sessions older than this are hard-deleted by the daily purge
    pub session_retention_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    pub base_url: String,
    pub max_concurrent_calls: usize,
    pub request_timeout_ms: u64,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| AppError::Config("DATABASE_URL missing".into()))?;

        let pod_id = std::env::var("POD_ID").unwrap_or_else(|_| {
            let suffix = Uuid::new_v4().simple().to_string();
            format!("pod-{}", &suffix[..8])
        });

        Ok(Config {
            app: AppConfig {
                env: std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
                port: env_or("PORT", 8080),
                pod_id,
                create_rate_per_minute: env_or("CREATE_RATE_PER_MINUTE", 30),
            },
            database: DatabaseConfig {
                url: database_url,
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", 20),
            },
            redis: RedisConfig {
                url: std::env::var("REDIS_URL")
                    .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
                command_timeout_ms: env_or("REDIS_COMMAND_TIMEOUT_MS", 3000),
                pending_event_ttl_secs: env_or("PENDING_EVENT_TTL_SECS", 1800),
                presence_ttl_secs: env_or("PRESENCE_TTL_SECS", 90),
            },
            kafka: KafkaConfig {
                brokers: std::env::var("KAFKA_BROKERS")
                    .unwrap_or_else(|_| "localhost:9092".to_string()),
                group_id: std::env::var("KAFKA_GROUP_ID")
                    .unwrap_or_else(|_| "broadcast-service".to_string()),
                topic_selected: std::env::var("KAFKA_TOPIC_SELECTED")
                    .unwrap_or_else(|_| "broadcast-selected".to_string()),
                topic_group: std::env::var("KAFKA_TOPIC_GROUP")
                    .unwrap_or_else(|_| "broadcast-group".to_string()),
                dispatcher_max_retries: env_or("DISPATCHER_MAX_RETRIES", 3),
                dispatcher_retry_backoff_ms: env_or("DISPATCHER_RETRY_BACKOFF_MS", 200),
            },
            outbox: OutboxConfig {
                poll_interval_ms: env_or("OUTBOX_POLL_INTERVAL_MS", 2000),
                batch_size: env_or("OUTBOX_BATCH_SIZE", 100),
            },
            sse: SseConfig {
                heartbeat_interval_ms: env_or("SSE_HEARTBEAT_INTERVAL_MS", 15000),
                channel_buffer: env_or("SSE_CHANNEL_BUFFER", 64),
            },
            lifecycle: LifecycleConfig {
                activation_interval_secs: env_or("ACTIVATION_INTERVAL_SECS", 60),
                expiration_interval_secs: env_or("EXPIRATION_INTERVAL_SECS", 60),
                session_cleanup_interval_secs: env_or("SESSION_CLEANUP_INTERVAL_SECS", 60),
                session_retention_days: env_or("SESSION_RETENTION_DAYS", 3),
            },
            directory: DirectoryConfig {
                base_url: std::env::var("USER_DIRECTORY_URL")
                    .unwrap_or_else(|_| "http://user-directory:8080".to_string()),
                max_concurrent_calls: env_or("DIRECTORY_MAX_CONCURRENT_CALLS", 10),
                request_timeout_ms: env_or("DIRECTORY_REQUEST_TIMEOUT_MS", 3000),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TargetType;

    #[test]
    fn dlt_topic_appends_suffix() {
        assert_eq!(KafkaConfig::dlt_topic("broadcast-selected"), "broadcast-selected.dlt");
    }

    #[test]
    fn topic_routing_by_target_type() {
        let kafka = KafkaConfig {
            brokers: String::new(),
            group_id: String::new(),
            topic_selected: "broadcast-selected".to_string(),
            topic_group: "broadcast-group".to_string(),
            dispatcher_max_retries: 3,
            dispatcher_retry_backoff_ms: 200,
        };

        assert_eq!(kafka.topic_for(TargetType::All), "broadcast-group");
        assert_eq!(kafka.topic_for(TargetType::Selected), "broadcast-selected");
        assert_eq!(kafka.topic_for(TargetType::Role), "broadcast-selected");
    }

    #[test]
    fn stale_threshold_is_three_heartbeats() {
        let sse = SseConfig {
            heartbeat_interval_ms: 15000,
            channel_buffer: 64,
        };
        assert_eq!(sse.stale_threshold_ms(), 45000);
    }
}
