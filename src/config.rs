//! Configuration management
//!
//! Sources, lowest precedence first: built-in defaults, `config/default`,
//! `config/local`, an explicit `--config` file, then `CONDUCTOR_*`
//! environment variables with `__` separating nested keys
//! (`CONDUCTOR_COORDINATION__MAX_BATCH_SIZE=8`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use conductor_core::config::{CoordinationSettings, MailboxSettings};
use conductor_core::routing::CapabilityTable;
use conductor_storage::DatabaseConfig;

use crate::{AppError, Result};

pub const ENV_PREFIX: &str = "CONDUCTOR";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseSection,
    pub coordination: CoordinationSettings,
    pub mailbox: MailboxSettings,
    pub workspace: WorkspaceConfig,
    pub worker: WorkerConfig,
    pub routing: CapabilityTable,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub url: String,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: "sqlite:.conductor/conductor.db".to_string(),
            max_connections: 8,
            busy_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Repository whose main line receives integrated work
    pub repo_path: PathBuf,
    /// Where worktrees are created; defaults under the user's local data dir
    pub workspaces_dir: Option<PathBuf>,
    pub main_branch: String,
    pub branch_prefix: String,
    pub commit_author_name: String,
    pub commit_author_email: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from("."),
            workspaces_dir: None,
            main_branch: "main".to_string(),
            branch_prefix: "conductor".to_string(),
            commit_author_name: "conductor".to_string(),
            commit_author_email: "conductor@localhost".to_string(),
        }
    }
}

impl WorkspaceConfig {
    pub fn resolved_workspaces_dir(&self) -> PathBuf {
        if let Some(dir) = &self.workspaces_dir {
            return dir.clone();
        }
        let repo_name = std::fs::canonicalize(&self.repo_path)
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .unwrap_or_else(|| "repo".to_string());
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("conductor")
            .join("workspaces")
            .join(repo_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Executable started for every work item
    pub command: String,
    /// Arguments placed before `<workspace_path> <work_item_id>`
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: "conductor-worker".to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `pretty` or `json`
    pub format: String,
    pub directory: PathBuf,
    pub file_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            directory: PathBuf::from(".conductor/logs"),
            file_enabled: true,
        }
    }
}

impl Config {
    /// Load configuration from files and environment
    pub fn load(explicit_file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false));
        if let Some(path) = explicit_file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_default("database.url", DatabaseSection::default().url)?
            .set_default("logging.level", "info")?
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.database.url.starts_with("sqlite:") {
            return Err(AppError::BadRequest(format!(
                "database.url must be a sqlite URL, got '{}'",
                self.database.url
            )));
        }
        if self.worker.command.trim().is_empty() {
            return Err(AppError::BadRequest(
                "worker.command cannot be empty".to_string(),
            ));
        }
        if self.workspace.main_branch.trim().is_empty() {
            return Err(AppError::BadRequest(
                "workspace.main_branch cannot be empty".to_string(),
            ));
        }
        self.coordination.validate()?;
        self.routing.validate()?;
        Ok(())
    }

    pub fn database_config(&self) -> DatabaseConfig {
        DatabaseConfig {
            url: self.database.url.clone(),
            max_connections: self.database.max_connections,
            busy_timeout: Duration::from_millis(self.database.busy_timeout_ms),
            migrate_on_startup: true,
        }
    }
}
