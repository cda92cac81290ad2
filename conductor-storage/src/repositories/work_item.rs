//! Work item repository
//!
//! Status changes are compare-and-swap updates keyed on the expected current
//! status. A `false` return means another writer moved the item first.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, Pool, Sqlite};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use tracing::{debug, error};

use super::{from_db_time, from_db_time_opt, to_db_time};
use crate::{Error, Result};
use conductor_core::work_item::{BlockedReason, WorkItem, WorkItemId, WorkItemStatus};

const TABLE: &str = "work_items";
const COLUMNS: &str = "id, title, footprint, status, required_role, dependencies, priority, spec_path, attempts, next_attempt_at, blocked_reason, archived, created_at, updated_at";

#[derive(Debug, FromRow)]
struct WorkItemRow {
    id: String,
    title: String,
    footprint: String,
    status: String,
    required_role: String,
    dependencies: String,
    priority: i64,
    spec_path: Option<String>,
    attempts: i64,
    next_attempt_at: Option<String>,
    blocked_reason: Option<String>,
    archived: bool,
    created_at: String,
    updated_at: String,
}

impl WorkItemRow {
    fn into_domain(self) -> Result<WorkItem> {
        Ok(WorkItem {
            id: WorkItemId::new(self.id),
            title: self.title,
            declared_footprint: serde_json::from_str(&self.footprint)?,
            status: self.status.parse()?,
            required_role: self.required_role.parse()?,
            dependencies: serde_json::from_str(&self.dependencies)?,
            priority: self.priority,
            spec_path: self.spec_path.map(PathBuf::from),
            attempts: u32::try_from(self.attempts)
                .map_err(|_| Error::corrupt(TABLE, format!("attempts {}", self.attempts)))?,
            next_attempt_at: from_db_time_opt(TABLE, self.next_attempt_at.as_deref())?,
            blocked_reason: self
                .blocked_reason
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            archived: self.archived,
            created_at: from_db_time(TABLE, &self.created_at)?,
            updated_at: from_db_time(TABLE, &self.updated_at)?,
        })
    }
}

/// Repository for work item entities
pub struct WorkItemRepository {
    pool: Pool<Sqlite>,
}

impl WorkItemRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Insert a new work item; an existing id is a conflict
    pub async fn create(&self, item: &WorkItem) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO work_items (id, title, footprint, status, required_role, dependencies,
                                    priority, spec_path, attempts, next_attempt_at, blocked_reason,
                                    archived, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
        )
        .bind(item.id.as_str())
        .bind(&item.title)
        .bind(serde_json::to_string(&item.declared_footprint)?)
        .bind(item.status.as_str())
        .bind(item.required_role.as_str())
        .bind(serde_json::to_string(&item.dependencies)?)
        .bind(item.priority)
        .bind(item.spec_path.as_ref().map(|p| p.to_string_lossy().to_string()))
        .bind(item.attempts as i64)
        .bind(item.next_attempt_at.map(to_db_time))
        .bind(
            item.blocked_reason
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(item.archived)
        .bind(to_db_time(item.created_at))
        .bind(to_db_time(item.updated_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(Error::Conflict(
                format!("work item {} already exists", item.id),
            )),
            Err(e) => {
                error!(work_item_id = %item.id, "Failed to insert work item: {}", e);
                Err(e.into())
            }
        }
    }

    pub async fn find_by_id(&self, id: &WorkItemId) -> Result<Option<WorkItem>> {
        let row = sqlx::query_as::<_, WorkItemRow>(&format!(
            "SELECT {} FROM work_items WHERE id = ?1",
            COLUMNS
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(WorkItemRow::into_domain).transpose()
    }

    pub async fn get(&self, id: &WorkItemId) -> Result<WorkItem> {
        self.find_by_id(id)
            .await?
            .ok_or_else(|| Error::not_found("WorkItem", id.as_str()))
    }

    pub async fn list(&self, include_archived: bool) -> Result<Vec<WorkItem>> {
        let rows = sqlx::query_as::<_, WorkItemRow>(&format!(
            "SELECT {} FROM work_items WHERE archived = 0 OR ?1 ORDER BY priority DESC, id",
            COLUMNS
        ))
        .bind(include_archived)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(WorkItemRow::into_domain).collect()
    }

    pub async fn list_by_status(&self, status: WorkItemStatus) -> Result<Vec<WorkItem>> {
        let rows = sqlx::query_as::<_, WorkItemRow>(&format!(
            "SELECT {} FROM work_items WHERE status = ?1 AND archived = 0 ORDER BY priority DESC, id",
            COLUMNS
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(WorkItemRow::into_domain).collect()
    }

    /// Pending items plus failed items whose backoff has elapsed
    pub async fn list_schedulable(&self, now: DateTime<Utc>) -> Result<Vec<WorkItem>> {
        let rows = sqlx::query_as::<_, WorkItemRow>(&format!(
            r#"
            SELECT {} FROM work_items
            WHERE archived = 0
              AND (status = 'pending'
                   OR (status = 'failed' AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)))
            ORDER BY priority DESC, id
            "#,
            COLUMNS
        ))
        .bind(to_db_time(now))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(WorkItemRow::into_domain).collect()
    }

    pub async fn succeeded_ids(&self) -> Result<HashSet<WorkItemId>> {
        let ids: Vec<(String,)> =
            sqlx::query_as("SELECT id FROM work_items WHERE status = 'succeeded'")
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().map(|(id,)| WorkItemId::new(id)).collect())
    }

    fn check_transition(id: &WorkItemId, from: WorkItemStatus, to: WorkItemStatus) -> Result<()> {
        if from.can_transition_to(to) {
            Ok(())
        } else {
            Err(conductor_core::Error::state_transition(format!(
                "Work item {} cannot move from {} to {}",
                id, from, to
            ))
            .into())
        }
    }

    /// Plain status move, e.g. Assigned -> Running or Running -> Succeeded
    pub async fn transition(
        &self,
        id: &WorkItemId,
        from: WorkItemStatus,
        to: WorkItemStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        Self::check_transition(id, from, to)?;
        let result = sqlx::query(
            "UPDATE work_items SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
        )
        .bind(to.as_str())
        .bind(to_db_time(now))
        .bind(id.as_str())
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        let moved = result.rows_affected() == 1;
        debug!(work_item_id = %id, %from, %to, moved, "Work item transition");
        Ok(moved)
    }

    /// Move to Assigned and count a new attempt
    pub async fn begin_attempt(
        &self,
        id: &WorkItemId,
        from: WorkItemStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        Self::check_transition(id, from, WorkItemStatus::Assigned)?;
        let result = sqlx::query(
            r#"
            UPDATE work_items
            SET status = 'assigned', attempts = attempts + 1, next_attempt_at = NULL,
                blocked_reason = NULL, updated_at = ?1
            WHERE id = ?2 AND status = ?3 AND archived = 0
            "#,
        )
        .bind(to_db_time(now))
        .bind(id.as_str())
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Move to Failed and schedule the next eligible attempt
    pub async fn record_failure(
        &self,
        id: &WorkItemId,
        from: WorkItemStatus,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        Self::check_transition(id, from, WorkItemStatus::Failed)?;
        let result = sqlx::query(
            r#"
            UPDATE work_items
            SET status = 'failed', next_attempt_at = ?1, updated_at = ?2
            WHERE id = ?3 AND status = ?4
            "#,
        )
        .bind(to_db_time(next_attempt_at))
        .bind(to_db_time(now))
        .bind(id.as_str())
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn block(
        &self,
        id: &WorkItemId,
        from: WorkItemStatus,
        reason: &BlockedReason,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        Self::check_transition(id, from, WorkItemStatus::Blocked)?;
        let result = sqlx::query(
            r#"
            UPDATE work_items
            SET status = 'blocked', blocked_reason = ?1, next_attempt_at = NULL, updated_at = ?2
            WHERE id = ?3 AND status = ?4
            "#,
        )
        .bind(serde_json::to_string(reason)?)
        .bind(to_db_time(now))
        .bind(id.as_str())
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn archive(&self, id: &WorkItemId, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE work_items SET archived = 1, updated_at = ?1 WHERE id = ?2 AND archived = 0",
        )
        .bind(to_db_time(now))
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn count_by_status(&self) -> Result<BTreeMap<String, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM work_items WHERE archived = 0 GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    pub async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM work_items")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
