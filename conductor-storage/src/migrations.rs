//! Schema creation
//!
//! Every statement is idempotent, so running migrations on an existing
//! store is a no-op.

use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::{Error, Result};

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    info!("Running database migrations");

    create_work_items_table(pool).await?;
    create_role_registrations_table(pool).await?;
    create_messages_table(pool).await?;
    create_agent_instances_table(pool).await?;
    create_events_table(pool).await?;

    info!("Database migrations completed successfully");
    Ok(())
}

async fn execute(pool: &SqlitePool, table: &str, statements: &[&str]) -> Result<()> {
    debug!("Creating {} table", table);
    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| Error::Migration(format!("{}: {}", table, e)))?;
    }
    Ok(())
}

async fn create_work_items_table(pool: &SqlitePool) -> Result<()> {
    execute(
        pool,
        "work_items",
        &[
            r#"
            CREATE TABLE IF NOT EXISTS work_items (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                footprint TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'assigned', 'running', 'succeeded', 'failed', 'blocked')),
                required_role TEXT NOT NULL,
                dependencies TEXT NOT NULL DEFAULT '[]',
                priority INTEGER NOT NULL DEFAULT 0,
                spec_path TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                next_attempt_at TEXT,
                blocked_reason TEXT,
                archived INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_work_items_status ON work_items(status, archived)",
        ],
    )
    .await
}

async fn create_role_registrations_table(pool: &SqlitePool) -> Result<()> {
    execute(
        pool,
        "role_registrations",
        &[r#"
            CREATE TABLE IF NOT EXISTS role_registrations (
                role TEXT PRIMARY KEY,
                holder_pid INTEGER NOT NULL,
                lease_token TEXT NOT NULL,
                claimed_at TEXT NOT NULL,
                last_heartbeat TEXT,
                released_at TEXT
            )
            "#],
    )
    .await
}

async fn create_messages_table(pool: &SqlitePool) -> Result<()> {
    execute(
        pool,
        "messages",
        &[
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                from_role TEXT NOT NULL,
                to_role TEXT NOT NULL,
                payload TEXT NOT NULL,
                priority_rank INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'delivered', 'processed')),
                intent TEXT,
                work_item_id TEXT,
                routed_via_fallback INTEGER NOT NULL DEFAULT 0,
                delivery_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                delivered_at TEXT,
                processed_at TEXT,
                archived INTEGER NOT NULL DEFAULT 0
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_messages_inbox ON messages(to_role, status, priority_rank DESC, created_at, seq)",
        ],
    )
    .await
}

async fn create_agent_instances_table(pool: &SqlitePool) -> Result<()> {
    execute(
        pool,
        "agent_instances",
        &[
            r#"
            CREATE TABLE IF NOT EXISTS agent_instances (
                id TEXT PRIMARY KEY,
                pid INTEGER,
                role TEXT NOT NULL,
                work_item_id TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                workspace_path TEXT NOT NULL,
                branch_name TEXT NOT NULL,
                state TEXT NOT NULL
                    CHECK (state IN ('spawned', 'running', 'succeeded', 'failed', 'hung', 'killed')),
                exit_reason TEXT,
                started_at TEXT NOT NULL,
                last_heartbeat TEXT NOT NULL,
                archived INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (work_item_id) REFERENCES work_items(id)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_agent_instances_active ON agent_instances(archived, state)",
        ],
    )
    .await
}

async fn create_events_table(pool: &SqlitePool) -> Result<()> {
    execute(
        pool,
        "events",
        &[
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                work_item_id TEXT,
                role TEXT,
                payload TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_events_work_item ON events(work_item_id)",
        ],
    )
    .await
}
