//! Repository implementations for all persisted entities

pub mod agent_instance;
pub mod event;
pub mod message;
pub mod registration;
pub mod work_item;

pub use agent_instance::AgentInstanceRepository;
pub use event::{EventRepository, StoredEvent};
pub use message::MessageRepository;
pub use registration::RegistrationRepository;
pub use work_item::WorkItemRepository;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::{Error, Result};

/// Timestamps are stored as fixed-width RFC 3339 text, so string order is
/// time order inside SQL comparisons.
pub(crate) fn to_db_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn from_db_time(table: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::corrupt(table, format!("bad timestamp '{}': {}", raw, e)))
}

pub(crate) fn from_db_time_opt(table: &str, raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|r| from_db_time(table, r)).transpose()
}

#[cfg(test)]
pub(crate) async fn test_pool() -> sqlx::SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    crate::migrations::run_migrations(&pool).await.unwrap();
    pool
}
