//! Persisted coordinator events

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, Pool, Sqlite};
use tracing::error;

use super::{from_db_time, to_db_time};
use crate::Result;

const TABLE: &str = "events";

#[derive(Debug, Clone, Serialize)]
pub struct StoredEvent {
    pub id: i64,
    pub kind: String,
    pub work_item_id: Option<String>,
    pub role: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct EventRow {
    id: i64,
    kind: String,
    work_item_id: Option<String>,
    role: Option<String>,
    payload: String,
    created_at: String,
}

impl EventRow {
    fn into_stored(self) -> Result<StoredEvent> {
        Ok(StoredEvent {
            id: self.id,
            kind: self.kind,
            work_item_id: self.work_item_id,
            role: self.role,
            payload: serde_json::from_str(&self.payload)?,
            created_at: from_db_time(TABLE, &self.created_at)?,
        })
    }
}

pub struct EventRepository {
    pool: Pool<Sqlite>,
}

impl EventRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn append(
        &self,
        kind: &str,
        work_item_id: Option<&str>,
        role: Option<&str>,
        payload: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<i64> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO events (kind, work_item_id, role, payload, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            RETURNING id
            "#,
        )
        .bind(kind)
        .bind(work_item_id)
        .bind(role)
        .bind(payload.to_string())
        .bind(to_db_time(at))
        .fetch_one(&self.pool)
        .await
        .inspect_err(|e| error!("Failed to create event of kind '{}': {:?}", kind, e))?;
        Ok(id)
    }

    pub async fn recent(&self, limit: i64) -> Result<Vec<StoredEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, kind, work_item_id, role, payload, created_at
            FROM events ORDER BY id DESC LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(EventRow::into_stored).collect()
    }

    pub async fn for_work_item(&self, work_item_id: &str) -> Result<Vec<StoredEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, kind, work_item_id, role, payload, created_at
            FROM events WHERE work_item_id = ?1 ORDER BY id
            "#,
        )
        .bind(work_item_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(EventRow::into_stored).collect()
    }

    pub async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
