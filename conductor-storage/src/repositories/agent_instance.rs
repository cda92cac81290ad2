//! Agent instance repository

use chrono::{DateTime, Utc};
use sqlx::{FromRow, Pool, Sqlite};
use std::path::PathBuf;
use uuid::Uuid;

use super::{from_db_time, to_db_time};
use crate::{Error, Result};
use conductor_core::agent_instance::{AgentInstance, AgentState};
use conductor_core::work_item::WorkItemId;

const TABLE: &str = "agent_instances";
const COLUMNS: &str = "id, pid, role, work_item_id, attempt, workspace_path, branch_name, state, exit_reason, started_at, last_heartbeat, archived";

#[derive(Debug, FromRow)]
struct AgentInstanceRow {
    id: String,
    pid: Option<i64>,
    role: String,
    work_item_id: String,
    attempt: i64,
    workspace_path: String,
    branch_name: String,
    state: String,
    exit_reason: Option<String>,
    started_at: String,
    last_heartbeat: String,
    archived: bool,
}

impl AgentInstanceRow {
    fn into_domain(self) -> Result<AgentInstance> {
        Ok(AgentInstance {
            id: Uuid::parse_str(&self.id).map_err(|e| Error::corrupt(TABLE, e.to_string()))?,
            pid: self.pid.and_then(|p| u32::try_from(p).ok()),
            role: self.role.parse()?,
            work_item_id: WorkItemId::new(self.work_item_id),
            attempt: u32::try_from(self.attempt)
                .map_err(|_| Error::corrupt(TABLE, format!("attempt {}", self.attempt)))?,
            workspace_path: PathBuf::from(self.workspace_path),
            branch_name: self.branch_name,
            state: self.state.parse()?,
            exit_reason: self.exit_reason,
            started_at: from_db_time(TABLE, &self.started_at)?,
            last_heartbeat: from_db_time(TABLE, &self.last_heartbeat)?,
            archived: self.archived,
        })
    }
}

/// Repository for agent instances
pub struct AgentInstanceRepository {
    pool: Pool<Sqlite>,
}

impl AgentInstanceRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn create(&self, instance: &AgentInstance) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agent_instances (id, pid, role, work_item_id, attempt, workspace_path,
                                         branch_name, state, exit_reason, started_at, last_heartbeat, archived)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(instance.id.to_string())
        .bind(instance.pid.map(|p| p as i64))
        .bind(instance.role.as_str())
        .bind(instance.work_item_id.as_str())
        .bind(instance.attempt as i64)
        .bind(instance.workspace_path.to_string_lossy().to_string())
        .bind(&instance.branch_name)
        .bind(instance.state.as_str())
        .bind(instance.exit_reason.as_deref())
        .bind(to_db_time(instance.started_at))
        .bind(to_db_time(instance.last_heartbeat))
        .bind(instance.archived)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<AgentInstance>> {
        let row = sqlx::query_as::<_, AgentInstanceRow>(&format!(
            "SELECT {} FROM agent_instances WHERE id = ?1",
            COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(AgentInstanceRow::into_domain).transpose()
    }

    /// Spawned or Running instances that are not archived
    pub async fn list_active(&self) -> Result<Vec<AgentInstance>> {
        let rows = sqlx::query_as::<_, AgentInstanceRow>(&format!(
            r#"
            SELECT {} FROM agent_instances
            WHERE archived = 0 AND state IN ('spawned', 'running')
            ORDER BY started_at
            "#,
            COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(AgentInstanceRow::into_domain).collect()
    }

    pub async fn list(&self, include_archived: bool) -> Result<Vec<AgentInstance>> {
        let rows = sqlx::query_as::<_, AgentInstanceRow>(&format!(
            "SELECT {} FROM agent_instances WHERE archived = 0 OR ?1 ORDER BY started_at",
            COLUMNS
        ))
        .bind(include_archived)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(AgentInstanceRow::into_domain).collect()
    }

    pub async fn list_for_work_item(&self, work_item_id: &WorkItemId) -> Result<Vec<AgentInstance>> {
        let rows = sqlx::query_as::<_, AgentInstanceRow>(&format!(
            "SELECT {} FROM agent_instances WHERE work_item_id = ?1 ORDER BY attempt",
            COLUMNS
        ))
        .bind(work_item_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(AgentInstanceRow::into_domain).collect()
    }

    pub async fn update_state(
        &self,
        id: Uuid,
        from: AgentState,
        to: AgentState,
        exit_reason: Option<&str>,
    ) -> Result<bool> {
        if !from.can_transition_to(to) {
            return Err(conductor_core::Error::state_transition(format!(
                "Agent instance {} cannot move from {} to {}",
                id, from, to
            ))
            .into());
        }
        let result = sqlx::query(
            r#"
            UPDATE agent_instances
            SET state = ?1, exit_reason = COALESCE(?2, exit_reason)
            WHERE id = ?3 AND state = ?4
            "#,
        )
        .bind(to.as_str())
        .bind(exit_reason)
        .bind(id.to_string())
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_pid(&self, id: Uuid, pid: u32) -> Result<()> {
        sqlx::query("UPDATE agent_instances SET pid = ?1 WHERE id = ?2")
            .bind(pid as i64)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn heartbeat(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE agent_instances SET last_heartbeat = ?1 WHERE id = ?2")
            .bind(to_db_time(at))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn archive(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE agent_instances SET archived = 1 WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count_active(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM agent_instances WHERE archived = 0 AND state IN ('spawned', 'running')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}
