//! Shared fixtures for the coordinator integration tests
//!
//! - a throwaway git repository with a `main` branch
//! - an in-memory store, registry and mailbox on a manual clock
//! - a scripted worker launcher that never spawns real processes

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, Utc};
use git2::{BranchType, IndexAddOption, Repository, Signature};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use conductor::coordinator::{Collaborators, ParallelExecutionCoordinator};
use conductor::events::{EventSink, StoreEventSink};
use conductor::workers::marker::{write_marker, WorkerOutcome};
use conductor::workers::{LaunchRequest, ProcessStatus, WorkerLauncher};
use conductor::workspace::git::GitSettings;
use conductor::workspace::GitWorkspaceManager;
use conductor_core::clock::{Clock, ManualClock, ProcessProbe};
use conductor_core::config::{CoordinationSettings, MailboxSettings, RetryPolicy};
use conductor_core::footprint::{FootprintResolver, SpecDocumentFootprint};
use conductor_core::routing::CapabilityTable;
use conductor_core::work_item::{Role, WorkItem, WorkItemId};
use conductor_storage::repositories::StoredEvent;
use conductor_storage::{MailboxRouter, SingletonRegistry, StorageManager};

/// What a scripted worker does when launched
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Write the files into the workspace, then exit with a success marker
    Succeed(Vec<(String, String)>),
    /// Exit with a failure marker
    Fail(String),
    /// Exit 0 without writing a marker
    ExitWithoutMarker,
    /// Keep running until terminated
    Hang,
    /// The launch itself fails
    SpawnError,
}

impl Behavior {
    pub fn edit(path: &str, contents: &str) -> Self {
        Behavior::Succeed(vec![(path.to_string(), contents.to_string())])
    }
}

#[derive(Debug)]
struct FakeProcess {
    request: LaunchRequest,
    running: bool,
    exit_code: Option<i32>,
}

/// Launcher and process probe backed by an in-memory process table
#[derive(Default)]
pub struct FakeLauncher {
    next_pid: AtomicU32,
    scripts: Mutex<HashMap<WorkItemId, VecDeque<Behavior>>>,
    processes: Mutex<HashMap<u32, FakeProcess>>,
    terminated: Mutex<Vec<u32>>,
    launches: Mutex<Vec<LaunchRequest>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(40_000),
            ..Default::default()
        }
    }

    /// Behaviors for consecutive launches of `id`; the last one repeats
    pub fn script(&self, id: &str, behaviors: Vec<Behavior>) {
        self.scripts
            .lock()
            .insert(WorkItemId::new(id), behaviors.into_iter().collect());
    }

    fn next_behavior(&self, id: &WorkItemId) -> Behavior {
        let mut scripts = self.scripts.lock();
        match scripts.get_mut(id) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(Behavior::Hang),
            Some(queue) => queue.front().cloned().unwrap_or(Behavior::Hang),
            None => Behavior::Succeed(Vec::new()),
        }
    }

    /// Make a running process exit as `behavior` would
    pub fn finish(&self, pid: u32, behavior: Behavior) {
        let mut processes = self.processes.lock();
        let process = processes.get_mut(&pid).expect("unknown pid");
        let (running, exit_code) = apply(&process.request, &behavior);
        process.running = running;
        process.exit_code = exit_code;
    }

    pub fn pid_of(&self, id: &str) -> Option<u32> {
        self.processes
            .lock()
            .iter()
            .filter(|(_, p)| p.request.work_item_id.as_str() == id)
            .map(|(pid, _)| *pid)
            .max()
    }

    pub fn terminated(&self) -> Vec<u32> {
        self.terminated.lock().clone()
    }

    pub fn launches_of(&self, id: &str) -> Vec<LaunchRequest> {
        self.launches
            .lock()
            .iter()
            .filter(|r| r.work_item_id.as_str() == id)
            .cloned()
            .collect()
    }
}

/// Returns `(still running, exit code)`
fn apply(request: &LaunchRequest, behavior: &Behavior) -> (bool, Option<i32>) {
    match behavior {
        Behavior::Succeed(files) => {
            for (path, contents) in files {
                let target = request.workspace_path.join(path);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent).unwrap();
                }
                std::fs::write(target, contents).unwrap();
            }
            write_marker(&request.marker_path, &WorkerOutcome::Success).unwrap();
            (false, Some(0))
        }
        Behavior::Fail(reason) => {
            write_marker(&request.marker_path, &WorkerOutcome::failure(reason.clone())).unwrap();
            (false, Some(1))
        }
        Behavior::ExitWithoutMarker => (false, Some(0)),
        Behavior::Hang => (true, None),
        Behavior::SpawnError => unreachable!("spawn errors never create a process"),
    }
}

#[async_trait]
impl WorkerLauncher for FakeLauncher {
    async fn launch(&self, request: &LaunchRequest) -> conductor::Result<u32> {
        self.launches.lock().push(request.clone());
        let behavior = self.next_behavior(&request.work_item_id);
        if matches!(behavior, Behavior::SpawnError) {
            return Err(conductor_core::Error::spawn_failed(
                &request.work_item_id,
                "scripted spawn failure",
            )
            .into());
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (running, exit_code) = apply(request, &behavior);
        self.processes.lock().insert(
            pid,
            FakeProcess {
                request: request.clone(),
                running,
                exit_code,
            },
        );
        Ok(pid)
    }

    async fn status(&self, pid: u32) -> conductor::Result<ProcessStatus> {
        Ok(match self.processes.lock().get(&pid) {
            Some(process) if process.running => ProcessStatus::Running,
            Some(process) => ProcessStatus::Exited(process.exit_code),
            None => ProcessStatus::Exited(None),
        })
    }

    async fn terminate(&self, pid: u32, _grace: std::time::Duration) -> conductor::Result<()> {
        self.terminated.lock().push(pid);
        if let Some(process) = self.processes.lock().get_mut(&pid) {
            process.running = false;
            process.exit_code = None;
        }
        Ok(())
    }
}

impl ProcessProbe for FakeLauncher {
    fn is_alive(&self, pid: u32) -> bool {
        self.processes
            .lock()
            .get(&pid)
            .map_or(false, |process| process.running)
    }
}

pub fn commit_all(repo: &Repository, message: &str) {
    let sig = Signature::now("Test User", "test@example.com").unwrap();
    let mut index = repo.index().unwrap();
    index.add_all(["*"], IndexAddOption::DEFAULT, None).unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let parents = match repo.head() {
        Ok(head) => vec![head.peel_to_commit().unwrap()],
        Err(_) => Vec::new(),
    };
    let parent_refs: Vec<_> = parents.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)
        .unwrap();
}

/// Coordination settings with short, round numbers
pub fn test_settings() -> CoordinationSettings {
    CoordinationSettings {
        staleness_timeout_seconds: 30,
        reclaim_grace_seconds: 120,
        heartbeat_interval_seconds: 10,
        poll_interval_ms: 10,
        max_batch_size: 4,
        kill_grace_seconds: 1,
        default_role_timeout_seconds: 600,
        role_timeouts: BTreeMap::from([("tester".to_string(), 60)]),
        retry: RetryPolicy {
            max_attempts: 2,
            initial_delay_seconds: 5,
            backoff_multiplier: 2.0,
            max_delay_seconds: 60,
        },
    }
}

pub struct Harness {
    pub repo_dir: TempDir,
    pub workspaces_dir: TempDir,
    pub storage: Arc<StorageManager>,
    pub registry: Arc<SingletonRegistry>,
    pub mailbox: Arc<MailboxRouter>,
    pub launcher: Arc<FakeLauncher>,
    pub clock: Arc<ManualClock>,
    pub settings: CoordinationSettings,
    coordinator: Option<ParallelExecutionCoordinator>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_settings(test_settings()).await
    }

    pub async fn with_settings(settings: CoordinationSettings) -> Self {
        let repo_dir = TempDir::new().unwrap();
        let workspaces_dir = TempDir::new().unwrap();
        let repo = Repository::init(repo_dir.path()).unwrap();
        repo.set_head("refs/heads/main").unwrap();
        std::fs::write(repo_dir.path().join("x.py"), "print('base')\n").unwrap();
        std::fs::write(repo_dir.path().join("README.md"), "# fixture\n").unwrap();
        commit_all(&repo, "Initial commit");

        let storage = Arc::new(StorageManager::in_memory().await.unwrap());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let launcher = Arc::new(FakeLauncher::new());
        let registry = Arc::new(SingletonRegistry::new(
            storage.registrations(),
            clock.clone(),
            launcher.clone(),
            settings.staleness_timeout(),
            settings.reclaim_grace(),
        ));
        let mailbox = Arc::new(MailboxRouter::new(
            storage.messages(),
            registry.clone(),
            CapabilityTable::default(),
            MailboxSettings::default(),
            clock.clone(),
        ));

        let mut harness = Self {
            coordinator: None,
            repo_dir,
            workspaces_dir,
            storage,
            registry,
            mailbox,
            launcher,
            clock,
            settings,
        };
        harness.coordinator = Some(harness.new_coordinator());
        harness
    }

    pub fn coordinator(&self) -> &ParallelExecutionCoordinator {
        self.coordinator.as_ref().expect("coordinator is built in Harness::new")
    }

    /// A second coordinator over the same store, repository and processes
    pub fn new_coordinator(&self) -> ParallelExecutionCoordinator {
        let resolver: Arc<dyn FootprintResolver> =
            Arc::new(SpecDocumentFootprint::new(Some(self.repo_dir.path().to_path_buf())).unwrap());
        let events: Arc<dyn EventSink> = Arc::new(StoreEventSink::new(self.storage.events()));
        let clock: Arc<dyn Clock> = self.clock.clone();
        ParallelExecutionCoordinator::new(
            Collaborators {
                storage: self.storage.clone(),
                registry: self.registry.clone(),
                mailbox: self.mailbox.clone(),
                workspaces: Arc::new(GitWorkspaceManager::new(self.git_settings())),
                launcher: self.launcher.clone(),
                resolver,
                events,
                clock,
            },
            self.settings.clone(),
        )
    }

    pub fn git_settings(&self) -> GitSettings {
        GitSettings {
            repo_path: self.repo_dir.path().to_path_buf(),
            workspaces_dir: self.workspaces_dir.path().to_path_buf(),
            main_branch: "main".to_string(),
            branch_prefix: "conductor".to_string(),
            author_name: "conductor".to_string(),
            author_email: "conductor@localhost".to_string(),
        }
    }

    pub async fn add(&self, item: WorkItem) {
        self.storage.work_items().create(&item).await.unwrap();
    }

    pub async fn item(&self, id: &str) -> WorkItem {
        self.storage
            .work_items()
            .get(&WorkItemId::new(id))
            .await
            .unwrap()
    }

    pub async fn events_of_kind(&self, kind: &str) -> Vec<StoredEvent> {
        self.storage
            .events()
            .recent(500)
            .await
            .unwrap()
            .into_iter()
            .filter(|event| event.kind == kind)
            .collect()
    }

    pub fn advance(&self, seconds: i64) {
        self.clock.advance(Duration::seconds(seconds));
    }

    pub fn main_file(&self, path: &str) -> Option<String> {
        let repo = Repository::open(self.repo_dir.path()).unwrap();
        let tree = repo
            .find_branch("main", BranchType::Local)
            .unwrap()
            .get()
            .peel_to_commit()
            .unwrap()
            .tree()
            .unwrap();
        let entry = tree.get_path(Path::new(path)).ok()?;
        let blob = repo.find_blob(entry.id()).unwrap();
        Some(String::from_utf8_lossy(blob.content()).into_owned())
    }

    pub fn workspace_path(&self, id: &str, attempt: u32) -> PathBuf {
        self.workspaces_dir
            .path()
            .join(format!("conductor-{}-{}", id, attempt))
    }
}

pub fn work_item(id: &str, role: Role, footprint: &[&str]) -> WorkItem {
    WorkItem::builder()
        .id(id)
        .role(role)
        .footprint(footprint.iter().copied())
        .build()
        .unwrap()
}
