//! Real-time broadcast messaging service.
//!
//! Admin-authored broadcasts fan out to targeted users over SSE with
//! at-least-once delivery: a transactional outbox couples the business
//! writes to Kafka events, per-pod dispatchers push to live sinks, and
//! reconnect replay covers everyone who was offline.

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod presence;
pub mod repository;
pub mod services;
pub mod sse;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use presence::PresenceStore;
pub use sse::{ConnectionManager, ConnectionRegistry, SseEvent};
