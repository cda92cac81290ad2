//! Message repository
//!
//! Inbox order is `(priority desc, created_at asc)`; the autoincrement `seq`
//! column breaks ties between messages created in the same microsecond.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, Pool, Sqlite};
use uuid::Uuid;

use super::{from_db_time, from_db_time_opt, to_db_time};
use crate::{Error, Result};
use conductor_core::message::{Message, MessagePriority, MessageStatus};
use conductor_core::work_item::{Role, WorkItemId};

const TABLE: &str = "messages";
const COLUMNS: &str = "id, from_role, to_role, payload, priority_rank, status, intent, work_item_id, routed_via_fallback, delivery_count, created_at, delivered_at, processed_at";

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    from_role: String,
    to_role: String,
    payload: String,
    priority_rank: i64,
    status: String,
    intent: Option<String>,
    work_item_id: Option<String>,
    routed_via_fallback: bool,
    delivery_count: i64,
    created_at: String,
    delivered_at: Option<String>,
    processed_at: Option<String>,
}

impl MessageRow {
    fn into_domain(self) -> Result<Message> {
        Ok(Message {
            id: Uuid::parse_str(&self.id).map_err(|e| Error::corrupt(TABLE, e.to_string()))?,
            from_role: self.from_role.parse()?,
            to_role: self.to_role.parse()?,
            payload: self.payload,
            priority: MessagePriority::from_rank(self.priority_rank)?,
            status: self.status.parse()?,
            intent: self.intent,
            work_item_id: self.work_item_id.map(WorkItemId::new),
            routed_via_fallback: self.routed_via_fallback,
            delivery_count: u32::try_from(self.delivery_count).unwrap_or(u32::MAX),
            created_at: from_db_time(TABLE, &self.created_at)?,
            delivered_at: from_db_time_opt(TABLE, self.delivered_at.as_deref())?,
            processed_at: from_db_time_opt(TABLE, self.processed_at.as_deref())?,
        })
    }
}

/// Repository for message entities
pub struct MessageRepository {
    pool: Pool<Sqlite>,
}

impl MessageRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn create(&self, message: &Message) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (id, from_role, to_role, payload, priority_rank, status, intent,
                                  work_item_id, routed_via_fallback, delivery_count, created_at,
                                  delivered_at, processed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(message.id.to_string())
        .bind(message.from_role.as_str())
        .bind(message.to_role.as_str())
        .bind(&message.payload)
        .bind(message.priority.rank())
        .bind(message.status.as_str())
        .bind(message.intent.as_deref())
        .bind(message.work_item_id.as_ref().map(|id| id.as_str().to_string()))
        .bind(message.routed_via_fallback)
        .bind(message.delivery_count as i64)
        .bind(to_db_time(message.created_at))
        .bind(message.delivered_at.map(to_db_time))
        .bind(message.processed_at.map(to_db_time))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {} FROM messages WHERE id = ?1",
            COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(MessageRow::into_domain).transpose()
    }

    /// Unacknowledged messages for a role in drain order
    pub async fn list_unprocessed(&self, to_role: Role) -> Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            r#"
            SELECT {} FROM messages
            WHERE to_role = ?1 AND status IN ('pending', 'delivered') AND archived = 0
            ORDER BY priority_rank DESC, created_at ASC, seq ASC
            "#,
            COLUMNS
        ))
        .bind(to_role.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(MessageRow::into_domain).collect()
    }

    /// Every non-archived message for a role, newest first
    pub async fn list_for_role(&self, to_role: Role, limit: i64) -> Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            r#"
            SELECT {} FROM messages
            WHERE to_role = ?1 AND archived = 0
            ORDER BY created_at DESC, seq DESC
            LIMIT ?2
            "#,
            COLUMNS
        ))
        .bind(to_role.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(MessageRow::into_domain).collect()
    }

    /// Pending -> Delivered; returns whether this call made the move
    pub async fn mark_delivered(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET status = 'delivered', delivered_at = ?1, delivery_count = delivery_count + 1
            WHERE id = ?2 AND status = 'pending'
            "#,
        )
        .bind(to_db_time(at))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Mark processed; repeated calls leave the first `processed_at` intact
    pub async fn mark_processed(&self, id: Uuid, at: DateTime<Utc>) -> Result<Message> {
        sqlx::query(
            r#"
            UPDATE messages
            SET status = 'processed', processed_at = ?1,
                delivered_at = COALESCE(delivered_at, ?1)
            WHERE id = ?2 AND status != 'processed'
            "#,
        )
        .bind(to_db_time(at))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        self.find_by_id(id)
            .await?
            .ok_or_else(|| Error::not_found("Message", id.to_string()))
    }

    /// Delivered but unacknowledged before `cutoff` goes back to Pending
    pub async fn redeliver_overdue(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE messages SET status = 'pending'
            WHERE status = 'delivered' AND delivered_at < ?1 AND archived = 0
            "#,
        )
        .bind(to_db_time(cutoff))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Number of unacknowledged messages sent before `message` at the same or higher priority
    pub async fn count_ahead_of(&self, message: &Message) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM messages AS m
            JOIN messages AS target ON target.id = ?1
            WHERE m.to_role = target.to_role
              AND m.status IN ('pending', 'delivered')
              AND m.archived = 0
              AND m.id != target.id
              AND m.priority_rank >= target.priority_rank
              AND (m.created_at < target.created_at
                   OR (m.created_at = target.created_at AND m.seq < target.seq))
            "#,
        )
        .bind(message.id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Mean seconds between delivery and acknowledgement over recent history
    pub async fn average_processing_seconds(&self, to_role: Role) -> Result<Option<f64>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT delivered_at, processed_at FROM messages
            WHERE to_role = ?1 AND status = 'processed'
              AND delivered_at IS NOT NULL AND processed_at IS NOT NULL
            ORDER BY processed_at DESC
            LIMIT 200
            "#,
        )
        .bind(to_role.as_str())
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }
        let mut total = 0.0;
        for (delivered, processed) in &rows {
            let span = from_db_time(TABLE, processed)? - from_db_time(TABLE, delivered)?;
            total += span.num_milliseconds().max(0) as f64 / 1000.0;
        }
        Ok(Some(total / rows.len() as f64))
    }

    pub async fn archive_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE messages SET archived = 1
            WHERE status = 'processed' AND processed_at < ?1 AND archived = 0
            "#,
        )
        .bind(to_db_time(cutoff))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn count_unprocessed(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM messages WHERE status IN ('pending', 'delivered') AND archived = 0",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
