//! Git worktree backed workspaces
//!
//! Each attempt gets its own worktree on branch `<prefix>/<id>-<attempt>`.
//! Integration merges in memory and publishes the result by moving the
//! main-line ref with a compare-and-swap, so a failure at any earlier step
//! leaves the main line exactly where it was.

use async_trait::async_trait;
use git2::{
    build::CheckoutBuilder, BranchType, ErrorCode, Index, IndexAddOption, Repository, Signature,
    StatusOptions, Worktree, WorktreeAddOptions, WorktreeLockStatus, WorktreePruneOptions,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{IntegrationResult, Workspace, WorkspaceManager, CONTROL_DIR, QUARANTINE_NOTE};
use crate::config::WorkspaceConfig;
use crate::workers::marker::clear_marker;
use crate::{AppError, Result};
use conductor_core::work_item::{Role, WorkItem, WorkItemId};

#[derive(Debug, Clone)]
pub struct GitSettings {
    pub repo_path: PathBuf,
    pub workspaces_dir: PathBuf,
    pub main_branch: String,
    pub branch_prefix: String,
    pub author_name: String,
    pub author_email: String,
}

impl GitSettings {
    pub fn from_config(config: &WorkspaceConfig) -> Self {
        Self {
            repo_path: config.repo_path.clone(),
            workspaces_dir: config.resolved_workspaces_dir(),
            main_branch: config.main_branch.clone(),
            branch_prefix: config.branch_prefix.clone(),
            author_name: config.commit_author_name.clone(),
            author_email: config.commit_author_email.clone(),
        }
    }

    fn open(&self) -> Result<Repository> {
        Ok(Repository::open(&self.repo_path)?)
    }

    fn signature(&self) -> Result<Signature<'static>> {
        Ok(Signature::now(&self.author_name, &self.author_email)?)
    }

    fn main_ref(&self) -> String {
        format!("refs/heads/{}", self.main_branch)
    }

    pub fn branch_name(&self, id: &WorkItemId, attempt: u32) -> String {
        format!(
            "{}/{}-{}",
            self.branch_prefix,
            id.as_str().replace("..", "-"),
            attempt
        )
    }
}

/// Worktree names cannot contain path separators
fn worktree_name(branch_name: &str) -> String {
    branch_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

struct Shared {
    settings: GitSettings,
    fail_before_ref_update: AtomicBool,
}

pub struct GitWorkspaceManager {
    shared: Arc<Shared>,
}

impl GitWorkspaceManager {
    pub fn new(settings: GitSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                fail_before_ref_update: AtomicBool::new(false),
            }),
        }
    }

    pub fn from_config(config: &WorkspaceConfig) -> Self {
        Self::new(GitSettings::from_config(config))
    }

    pub fn settings(&self) -> &GitSettings {
        &self.shared.settings
    }

    /// Make the next integration fail after the merge commit is written but
    /// before the main-line ref moves
    pub fn inject_ref_update_failure(&self) {
        self.shared
            .fail_before_ref_update
            .store(true, Ordering::SeqCst);
    }

    async fn blocking<T, F>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&Shared) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || task(&shared))
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("git task panicked: {}", e)))?
    }
}

#[async_trait]
impl WorkspaceManager for GitWorkspaceManager {
    async fn provision(&self, item: &WorkItem, role: Role, attempt: u32) -> Result<Workspace> {
        let id = item.id.clone();
        let workspace = self
            .blocking(move |shared| provision(&shared.settings, &id, attempt))
            .await?;
        info!(
            work_item_id = %workspace.work_item_id,
            %role,
            attempt,
            branch = %workspace.branch_name,
            path = %workspace.path.display(),
            "Workspace provisioned"
        );
        Ok(workspace)
    }

    async fn integrate(&self, workspace: &Workspace) -> Result<IntegrationResult> {
        let target = workspace.clone();
        let result = self.blocking(move |shared| integrate(shared, &target)).await?;
        if result.merged {
            info!(
                work_item_id = %workspace.work_item_id,
                branch = %workspace.branch_name,
                commit = result.commit.as_deref().unwrap_or("-"),
                "Workspace integrated"
            );
        } else {
            warn!(
                work_item_id = %workspace.work_item_id,
                branch = %workspace.branch_name,
                conflicts = ?result.conflicts,
                "Integration conflicts, main line untouched"
            );
        }
        Ok(result)
    }

    async fn teardown(&self, workspace: &Workspace) -> Result<()> {
        let target = workspace.clone();
        self.blocking(move |shared| {
            let repo = shared.settings.open()?;
            remove_worktree(&repo, &worktree_name(&target.branch_name), &target.path)?;
            delete_branch(&repo, &target.branch_name)
        })
        .await?;
        debug!(
            work_item_id = %workspace.work_item_id,
            branch = %workspace.branch_name,
            "Workspace torn down"
        );
        Ok(())
    }

    async fn quarantine(&self, workspace: &Workspace, reason: &str) -> Result<()> {
        let target = workspace.clone();
        let reason = reason.to_string();
        self.blocking(move |shared| quarantine(&shared.settings, &target, &reason))
            .await?;
        warn!(
            work_item_id = %workspace.work_item_id,
            path = %workspace.path.display(),
            "Workspace quarantined"
        );
        Ok(())
    }

    async fn prune(&self) -> Result<usize> {
        self.blocking(|shared| prune(&shared.settings)).await
    }
}

fn provision(settings: &GitSettings, id: &WorkItemId, attempt: u32) -> Result<Workspace> {
    let repo = settings.open()?;
    let main_commit = repo
        .find_branch(&settings.main_branch, BranchType::Local)?
        .get()
        .peel_to_commit()?;

    let branch_name = settings.branch_name(id, attempt);
    let name = worktree_name(&branch_name);
    let path = settings.workspaces_dir.join(&name);

    // Leftovers of an earlier run of the same attempt
    remove_worktree(&repo, &name, &path)?;
    delete_branch(&repo, &branch_name)?;

    std::fs::create_dir_all(&settings.workspaces_dir)?;
    let branch = repo.branch(&branch_name, &main_commit, false)?;
    let mut opts = WorktreeAddOptions::new();
    opts.reference(Some(branch.get()));
    repo.worktree(&name, &path, Some(&opts))?;

    let workspace = Workspace {
        work_item_id: id.clone(),
        path,
        branch_name,
        attempt,
    };
    let control = workspace.control_dir();
    std::fs::create_dir_all(&control)?;
    std::fs::write(control.join(".gitignore"), "*\n")?;
    // A marker checked in on the main line is not this attempt's result
    clear_marker(&workspace.marker_path())?;
    Ok(workspace)
}

fn integrate(shared: &Shared, workspace: &Workspace) -> Result<IntegrationResult> {
    let settings = &shared.settings;
    if !workspace.exists() {
        return Err(AppError::workspace(
            &workspace.work_item_id,
            format!("workspace {} is missing", workspace.path.display()),
        ));
    }

    let signature = settings.signature()?;
    let branch_oid = {
        let worktree = Repository::open(&workspace.path)?;
        commit_pending_changes(&worktree, &signature, &workspace.work_item_id)?;
        let head = worktree.head()?.peel_to_commit()?;
        head.id()
    };

    let repo = settings.open()?;
    let main_ref = settings.main_ref();
    let main_oid = repo.refname_to_id(&main_ref)?;

    if main_oid == branch_oid || repo.graph_descendant_of(main_oid, branch_oid)? {
        debug!(work_item_id = %workspace.work_item_id, "Nothing new to integrate");
        return Ok(IntegrationResult::merged(main_oid.to_string()));
    }

    let message = format!(
        "Integrate {} from {}",
        workspace.work_item_id, workspace.branch_name
    );
    let new_oid = if repo.graph_descendant_of(branch_oid, main_oid)? {
        branch_oid
    } else {
        let main_commit = repo.find_commit(main_oid)?;
        let branch_commit = repo.find_commit(branch_oid)?;
        let base = repo.merge_base(main_oid, branch_oid)?;
        let base_tree = repo.find_commit(base)?.tree()?;

        let mut index =
            repo.merge_trees(&base_tree, &main_commit.tree()?, &branch_commit.tree()?, None)?;
        if index.has_conflicts() {
            return Ok(IntegrationResult::conflicted(conflict_paths(&index)?));
        }
        let tree = repo.find_tree(index.write_tree_to(&repo)?)?;
        repo.commit(
            None,
            &signature,
            &signature,
            &message,
            &tree,
            &[&main_commit, &branch_commit],
        )?
    };

    if shared.fail_before_ref_update.swap(false, Ordering::SeqCst) {
        return Err(AppError::workspace(
            &workspace.work_item_id,
            "injected failure before main-line update",
        ));
    }

    let sync_checkout = main_is_checked_out(&repo, &main_ref) && working_tree_clean(&repo)?;
    repo.reference_matching(&main_ref, new_oid, true, main_oid, &message)?;

    if sync_checkout {
        if let Err(e) = repo.checkout_head(Some(CheckoutBuilder::new().force())) {
            warn!(
                work_item_id = %workspace.work_item_id,
                "Main line moved but its checkout could not be refreshed: {}", e
            );
        }
    }
    Ok(IntegrationResult::merged(new_oid.to_string()))
}

/// Commit whatever the worker left uncommitted; false when nothing changed
fn commit_pending_changes(
    repo: &Repository,
    signature: &Signature<'_>,
    id: &WorkItemId,
) -> Result<bool> {
    let mut index = repo.index()?;
    index.add_all(["*"], IndexAddOption::DEFAULT, None)?;
    index.update_all(["*"], None)?;
    index.write()?;
    let tree_oid = index.write_tree()?;

    let head = repo.head()?.peel_to_commit()?;
    if head.tree_id() == tree_oid {
        return Ok(false);
    }
    let tree = repo.find_tree(tree_oid)?;
    repo.commit(
        Some("HEAD"),
        signature,
        signature,
        &format!("Work item {}", id),
        &tree,
        &[&head],
    )?;
    Ok(true)
}

fn conflict_paths(index: &Index) -> Result<Vec<String>> {
    let mut paths = Vec::new();
    for conflict in index.conflicts()? {
        let conflict = conflict?;
        if let Some(entry) = conflict.our.or(conflict.their).or(conflict.ancestor) {
            paths.push(String::from_utf8_lossy(&entry.path).to_string());
        }
    }
    paths.sort();
    paths.dedup();
    Ok(paths)
}

fn main_is_checked_out(repo: &Repository, main_ref: &str) -> bool {
    !repo.is_bare()
        && repo
            .head()
            .ok()
            .and_then(|head| head.name().map(|n| n == main_ref))
            .unwrap_or(false)
}

fn working_tree_clean(repo: &Repository) -> Result<bool> {
    let mut opts = StatusOptions::new();
    opts.include_untracked(false).include_ignored(false);
    Ok(repo.statuses(Some(&mut opts))?.is_empty())
}

fn remove_worktree(repo: &Repository, name: &str, path: &Path) -> Result<()> {
    if let Some(worktree) = find_worktree(repo, name)? {
        let mut opts = WorktreePruneOptions::new();
        opts.valid(true)
            .locked(true)
            .working_tree(worktree.path().exists());
        worktree.prune(Some(&mut opts))?;
    }
    if path.exists() {
        std::fs::remove_dir_all(path)?;
    }
    Ok(())
}

fn find_worktree(repo: &Repository, name: &str) -> Result<Option<Worktree>> {
    let registered = repo.worktrees()?.iter().flatten().any(|n| n == name);
    if !registered {
        return Ok(None);
    }
    Ok(Some(repo.find_worktree(name)?))
}

fn delete_branch(repo: &Repository, branch_name: &str) -> Result<()> {
    match repo.find_branch(branch_name, BranchType::Local) {
        Ok(mut branch) => Ok(branch.delete()?),
        Err(e) if e.code() == ErrorCode::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn quarantine(settings: &GitSettings, workspace: &Workspace, reason: &str) -> Result<()> {
    if !workspace.exists() {
        warn!(
            work_item_id = %workspace.work_item_id,
            "Workspace to quarantine no longer exists"
        );
        return Ok(());
    }

    let control = workspace.path.join(CONTROL_DIR);
    std::fs::create_dir_all(&control)?;
    std::fs::write(
        control.join(QUARANTINE_NOTE),
        format!(
            "work item: {}\nbranch: {}\nat: {}\nreason: {}\n",
            workspace.work_item_id,
            workspace.branch_name,
            chrono::Utc::now().to_rfc3339(),
            reason
        ),
    )?;

    let repo = settings.open()?;
    if let Some(worktree) = find_worktree(&repo, &worktree_name(&workspace.branch_name))? {
        if matches!(worktree.is_locked()?, WorktreeLockStatus::Unlocked) {
            worktree.lock(Some(reason))?;
        }
    }
    Ok(())
}

fn prune(settings: &GitSettings) -> Result<usize> {
    let repo = settings.open()?;
    let prefix = format!("{}-", worktree_name(&settings.branch_prefix));
    let mut pruned = 0;
    for name in repo.worktrees()?.iter().flatten() {
        if !name.starts_with(&prefix) {
            continue;
        }
        let worktree = repo.find_worktree(name)?;
        if worktree.path().exists() {
            continue;
        }
        match worktree.prune(None) {
            Ok(()) => {
                info!(worktree = name, "Pruned orphaned worktree");
                pruned += 1;
            }
            Err(e) => warn!(worktree = name, "Failed to prune worktree: {}", e),
        }
    }
    Ok(pruned)
}
