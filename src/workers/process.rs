//! Worker process launcher
//!
//! Workers run as `<command> <args...> <workspace_path> <work_item_id>` with
//! the workspace as working directory, in their own process group, with
//! stdout and stderr appended to the workspace's worker log.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, Signal, System};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::Result;
use conductor_core::clock::ProcessProbe;
use conductor_core::work_item::{Role, WorkItemId};

pub const ENV_WORKSPACE: &str = "CONDUCTOR_WORKSPACE";
pub const ENV_WORK_ITEM: &str = "CONDUCTOR_WORK_ITEM";
pub const ENV_MARKER: &str = "CONDUCTOR_MARKER";
pub const ENV_ROLE: &str = "CONDUCTOR_ROLE";
pub const ENV_ATTEMPT: &str = "CONDUCTOR_ATTEMPT";

#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub work_item_id: WorkItemId,
    pub role: Role,
    pub attempt: u32,
    pub workspace_path: PathBuf,
    pub marker_path: PathBuf,
    pub log_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    /// Exit code when the process was our child and exited normally
    Exited(Option<i32>),
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Start a worker and return its pid
    async fn launch(&self, request: &LaunchRequest) -> Result<u32>;

    /// Non-blocking status check
    async fn status(&self, pid: u32) -> Result<ProcessStatus>;

    /// SIGTERM the process and its descendants, SIGKILL whatever survives `grace`
    async fn terminate(&self, pid: u32, grace: Duration) -> Result<()>;
}

pub struct ProcessLauncher {
    config: WorkerConfig,
    probe: Arc<dyn ProcessProbe>,
    children: Mutex<HashMap<u32, Child>>,
}

impl ProcessLauncher {
    pub fn new(config: WorkerConfig, probe: Arc<dyn ProcessProbe>) -> Self {
        Self {
            config,
            probe,
            children: Mutex::new(HashMap::new()),
        }
    }

    fn build_command(&self, request: &LaunchRequest) -> Result<Command> {
        if let Some(parent) = request.log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&request.log_path)?;

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .arg(&request.workspace_path)
            .arg(request.work_item_id.as_str())
            .current_dir(&request.workspace_path)
            .envs(&self.config.env)
            .env(ENV_WORKSPACE, &request.workspace_path)
            .env(ENV_WORK_ITEM, request.work_item_id.as_str())
            .env(ENV_MARKER, &request.marker_path)
            .env(ENV_ROLE, request.role.as_str())
            .env(ENV_ATTEMPT, request.attempt.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log));
        #[cfg(unix)]
        cmd.process_group(0);
        Ok(cmd)
    }

    fn is_running(&self, pid: u32) -> Result<bool> {
        let mut children = self.children.lock();
        if let Some(child) = children.get_mut(&pid) {
            return match child.try_wait()? {
                Some(_) => Ok(false),
                None => Ok(true),
            };
        }
        Ok(self.probe.is_alive(pid))
    }
}

/// `root` followed by all of its descendants
fn process_tree(system: &System, root: u32) -> Vec<Pid> {
    let mut tree = vec![Pid::from_u32(root)];
    let mut next = 0;
    while next < tree.len() {
        let parent = tree[next];
        for (pid, process) in system.processes() {
            if process.parent() == Some(parent) && !tree.contains(pid) {
                tree.push(*pid);
            }
        }
        next += 1;
    }
    tree
}

fn signal_tree(system: &System, tree: &[Pid], signal: Signal) -> usize {
    let mut signalled = 0;
    for pid in tree {
        if let Some(process) = system.process(*pid) {
            let delivered = match process.kill_with(signal) {
                Some(delivered) => delivered,
                None => process.kill(),
            };
            if delivered {
                signalled += 1;
            }
        }
    }
    signalled
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<u32> {
        let mut cmd = self.build_command(request)?;
        debug!(
            work_item_id = %request.work_item_id,
            command = %self.config.command,
            "Spawning worker: {:?}", cmd
        );
        let child = cmd.spawn().map_err(|e| {
            conductor_core::Error::spawn_failed(
                &request.work_item_id,
                format!("{}: {}", self.config.command, e),
            )
        })?;
        let pid = child.id().ok_or_else(|| {
            conductor_core::Error::spawn_failed(&request.work_item_id, "worker exited immediately")
        })?;
        self.children.lock().insert(pid, child);

        info!(
            work_item_id = %request.work_item_id,
            role = %request.role,
            attempt = request.attempt,
            pid,
            "Worker process spawned"
        );
        Ok(pid)
    }

    async fn status(&self, pid: u32) -> Result<ProcessStatus> {
        let mut children = self.children.lock();
        if let Some(child) = children.get_mut(&pid) {
            return match child.try_wait()? {
                Some(status) => {
                    children.remove(&pid);
                    Ok(ProcessStatus::Exited(status.code()))
                }
                None => Ok(ProcessStatus::Running),
            };
        }
        drop(children);

        // Not spawned by this process, e.g. after a coordinator restart
        if self.probe.is_alive(pid) {
            Ok(ProcessStatus::Running)
        } else {
            Ok(ProcessStatus::Exited(None))
        }
    }

    async fn terminate(&self, pid: u32, grace: Duration) -> Result<()> {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        let tree = process_tree(&system, pid);
        let signalled = signal_tree(&system, &tree, Signal::Term);
        info!(pid, processes = tree.len(), signalled, "Sent SIGTERM to worker tree");

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if !self.is_running(pid)? {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        system.refresh_processes(ProcessesToUpdate::All, true);
        let mut survivors = process_tree(&system, pid);
        for member in tree {
            if !survivors.contains(&member) && system.process(member).is_some() {
                survivors.push(member);
            }
        }
        if self.is_running(pid)? || survivors.len() > 1 {
            let killed = signal_tree(&system, &survivors, Signal::Kill);
            warn!(pid, killed, "Worker ignored SIGTERM, sent SIGKILL");
        }

        let child = self.children.lock().remove(&pid);
        if let Some(mut child) = child {
            let _ = child.start_kill();
            if tokio::time::timeout(grace.max(Duration::from_secs(1)), child.wait())
                .await
                .is_err()
            {
                warn!(pid, "Worker did not exit after SIGKILL");
            }
        }
        Ok(())
    }
}
