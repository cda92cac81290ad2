//! Storage manager coordinating database access

use serde::Serialize;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Pool, Sqlite,
};
use std::collections::BTreeMap;
use std::{str::FromStr, sync::Arc, time::Duration};
use tracing::info;

use crate::{migrations, repositories::*, Error, Result};

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub busy_timeout: Duration,
    pub migrate_on_startup: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:.conductor/conductor.db".to_string(),
            max_connections: 8,
            busy_timeout: Duration::from_secs(5),
            migrate_on_startup: true,
        }
    }
}

/// Main storage manager coordinating all repositories
pub struct StorageManager {
    pool: Pool<Sqlite>,
    work_items: Arc<WorkItemRepository>,
    registrations: Arc<RegistrationRepository>,
    messages: Arc<MessageRepository>,
    agent_instances: Arc<AgentInstanceRepository>,
    events: Arc<EventRepository>,
}

impl StorageManager {
    /// Connect to a file-backed store, creating it when missing
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        info!("Connecting to database: {}", config.url);

        ensure_parent_dir(&config.url)?;
        let connect_opts = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(connect_opts)
            .await?;

        info!("Database connection established");
        let manager = Self::from_pool(pool);
        if config.migrate_on_startup {
            manager.migrate().await?;
        }
        Ok(manager)
    }

    /// Single-connection in-memory store, migrated
    pub async fn in_memory() -> Result<Self> {
        let connect_opts = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_opts)
            .await?;
        let manager = Self::from_pool(pool);
        manager.migrate().await?;
        Ok(manager)
    }

    pub fn from_pool(pool: Pool<Sqlite>) -> Self {
        Self {
            work_items: Arc::new(WorkItemRepository::new(pool.clone())),
            registrations: Arc::new(RegistrationRepository::new(pool.clone())),
            messages: Arc::new(MessageRepository::new(pool.clone())),
            agent_instances: Arc::new(AgentInstanceRepository::new(pool.clone())),
            events: Arc::new(EventRepository::new(pool.clone())),
            pool,
        }
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        migrations::run_migrations(&self.pool).await
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub fn work_items(&self) -> Arc<WorkItemRepository> {
        self.work_items.clone()
    }

    pub fn registrations(&self) -> Arc<RegistrationRepository> {
        self.registrations.clone()
    }

    pub fn messages(&self) -> Arc<MessageRepository> {
        self.messages.clone()
    }

    pub fn agent_instances(&self) -> Arc<AgentInstanceRepository> {
        self.agent_instances.clone()
    }

    pub fn events(&self) -> Arc<EventRepository> {
        self.events.clone()
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    /// Get database statistics
    pub async fn stats(&self) -> Result<DatabaseStats> {
        Ok(DatabaseStats {
            work_items_by_status: self.work_items.count_by_status().await?,
            active_registrations: self.registrations.count().await?,
            unprocessed_messages: self.messages.count_unprocessed().await?,
            active_instances: self.agent_instances.count_active().await?,
            events: self.events.count().await?,
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn ensure_parent_dir(url: &str) -> Result<()> {
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() || path.starts_with(":memory:") {
        return Ok(());
    }
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Internal(anyhow::anyhow!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
    }
    Ok(())
}

/// Database statistics
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub work_items_by_status: BTreeMap<String, i64>,
    pub active_registrations: i64,
    pub unprocessed_messages: i64,
    pub active_instances: i64,
    pub events: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_backed_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            url: format!("sqlite:{}", dir.path().join("nested/store.db").display()),
            ..Default::default()
        };
        let storage = StorageManager::new(&config).await.unwrap();
        storage.health_check().await.unwrap();

        let stats = storage.stats().await.unwrap();
        assert!(stats.work_items_by_status.is_empty());
        assert_eq!(stats.active_instances, 0);
        assert!(dir.path().join("nested/store.db").exists());
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let storage = StorageManager::in_memory().await.unwrap();
        storage.health_check().await.unwrap();
        assert_eq!(storage.stats().await.unwrap().events, 0);
    }
}
