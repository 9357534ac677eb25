//! Typed SQL access, one file per entity. Row mapping is hand-written
//! `try_get` per column; conditional updates return affected-row counts so
//! callers can detect races instead of re-reading.

mod broadcasts;
mod dlt;
mod preferences;
mod sessions;
mod statistics;
mod user_broadcasts;

pub use broadcasts::{BroadcastFilter, BroadcastRepository, NewBroadcast};
pub use dlt::DltRepository;
pub use preferences::PreferencesRepository;
pub use sessions::SessionRepository;
pub use statistics::StatisticsRepository;
pub use user_broadcasts::UserBroadcastRepository;
