//! Isolated per-work-item workspaces and their integration into the main line

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::Result;
use conductor_core::agent_instance::AgentInstance;
use conductor_core::work_item::{Role, WorkItem, WorkItemId};

pub mod git;

pub use git::GitWorkspaceManager;

/// Control directory inside every workspace, ignored by version control
pub const CONTROL_DIR: &str = ".conductor";
pub const RESULT_MARKER: &str = "result.json";
pub const WORKER_LOG: &str = "worker.log";
pub const QUARANTINE_NOTE: &str = "QUARANTINE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub work_item_id: WorkItemId,
    pub path: PathBuf,
    pub branch_name: String,
    pub attempt: u32,
}

impl Workspace {
    /// Rebuild the handle of a workspace recorded on an agent instance
    pub fn of_instance(instance: &AgentInstance) -> Self {
        Self {
            work_item_id: instance.work_item_id.clone(),
            path: instance.workspace_path.clone(),
            branch_name: instance.branch_name.clone(),
            attempt: instance.attempt,
        }
    }

    pub fn control_dir(&self) -> PathBuf {
        self.path.join(CONTROL_DIR)
    }

    pub fn marker_path(&self) -> PathBuf {
        self.control_dir().join(RESULT_MARKER)
    }

    pub fn log_path(&self) -> PathBuf {
        self.control_dir().join(WORKER_LOG)
    }

    pub fn exists(&self) -> bool {
        Path::new(&self.path).is_dir()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrationResult {
    pub merged: bool,
    /// Paths git could not merge; empty when `merged`
    pub conflicts: Vec<String>,
    /// Main-line commit after integration
    pub commit: Option<String>,
}

impl IntegrationResult {
    pub fn merged(commit: String) -> Self {
        Self {
            merged: true,
            conflicts: Vec::new(),
            commit: Some(commit),
        }
    }

    pub fn conflicted(conflicts: Vec<String>) -> Self {
        Self {
            merged: false,
            conflicts,
            commit: None,
        }
    }
}

#[async_trait]
pub trait WorkspaceManager: Send + Sync {
    /// Fresh checkout on a dedicated branch cut from the current main line
    async fn provision(&self, item: &WorkItem, role: Role, attempt: u32) -> Result<Workspace>;

    /// Merge the workspace branch into the main line; never commits a partial merge
    async fn integrate(&self, workspace: &Workspace) -> Result<IntegrationResult>;

    /// Remove the checkout and delete its branch
    async fn teardown(&self, workspace: &Workspace) -> Result<()>;

    /// Keep the checkout for manual inspection
    async fn quarantine(&self, workspace: &Workspace, reason: &str) -> Result<()>;

    /// Forget workspaces whose directories no longer exist; returns how many
    async fn prune(&self) -> Result<usize>;
}
