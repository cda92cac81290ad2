//! Parallel execution coordinator
//!
//! A pass polls every live worker, schedules a batch of mutually independent
//! work items and sweeps the mailbox. Each status change is a conditional
//! store update; a pass that loses a race leaves the item to the next pass.
//!
//! Lifecycle of one attempt:
//!
//! 1. claim the item's role with the coordinator's pid
//! 2. `Pending|Failed -> Assigned`, provision a workspace, launch the worker
//! 3. hand the lease to the worker pid, record the instance, `-> Running`
//! 4. on exit, read the result marker: integrate on success, otherwise
//!    apply the retry policy
//! 5. release the lease

mod report;

pub use report::{
    BacklogAnalysis, DeferredItem, PassReport, PollReport, RecoveryReport, RunOutcome,
    ScheduleResult, StartFailure, StartedInstance,
};

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::events::{CoordinatorEvent, EventSink};
use crate::workers::{read_marker, LaunchRequest, ProcessStatus, WorkerLauncher, WorkerOutcome};
use crate::workspace::{Workspace, WorkspaceManager};
use crate::{AppError, Result};
use conductor_core::agent_instance::{AgentInstance, AgentState};
use conductor_core::analyzer::{self, AnalysisReport};
use conductor_core::clock::Clock;
use conductor_core::config::CoordinationSettings;
use conductor_core::Error as CoreError;
use conductor_core::footprint::FootprintResolver;
use conductor_core::message::MessagePriority;
use conductor_core::registration::Lease;
use conductor_core::work_item::{BlockedReason, Role, WorkItem, WorkItemId, WorkItemStatus};
use conductor_storage::repositories::{AgentInstanceRepository, WorkItemRepository};
use conductor_storage::{MailboxRouter, SingletonRegistry, StorageManager};

/// Longest pause between store health checks while the store is down
const MAX_STORE_BACKOFF: std::time::Duration = std::time::Duration::from_secs(30);

/// Everything the coordinator drives
pub struct Collaborators {
    pub storage: Arc<StorageManager>,
    pub registry: Arc<SingletonRegistry>,
    pub mailbox: Arc<MailboxRouter>,
    pub workspaces: Arc<dyn WorkspaceManager>,
    pub launcher: Arc<dyn WorkerLauncher>,
    pub resolver: Arc<dyn FootprintResolver>,
    pub events: Arc<dyn EventSink>,
    pub clock: Arc<dyn Clock>,
}

/// Why an attempt ended without a result
#[derive(Debug, Clone)]
enum Failure {
    SpawnFailed(String),
    Crashed(String),
    Hung { timeout_seconds: u64 },
}

impl Failure {
    fn reason(&self) -> String {
        match self {
            Failure::SpawnFailed(message) => format!("worker failed to start: {}", message),
            Failure::Crashed(reason) => reason.clone(),
            Failure::Hung { timeout_seconds } => {
                format!("no result within {}s", timeout_seconds)
            }
        }
    }

    fn error(&self, work_item_id: &WorkItemId) -> CoreError {
        match self {
            Failure::SpawnFailed(message) => CoreError::spawn_failed(work_item_id, message.clone()),
            Failure::Crashed(reason) => CoreError::crashed(work_item_id, reason.clone()),
            Failure::Hung { timeout_seconds } => CoreError::AgentHung {
                work_item_id: work_item_id.clone(),
                timeout_seconds: *timeout_seconds,
            },
        }
    }

    fn blocked_reason(&self, attempts: u32) -> BlockedReason {
        match self {
            Failure::SpawnFailed(message) => BlockedReason::SpawnFailed {
                message: message.clone(),
                attempts,
            },
            Failure::Crashed(reason) => BlockedReason::Crashed {
                reason: reason.clone(),
                attempts,
            },
            Failure::Hung { .. } => BlockedReason::Hung { attempts },
        }
    }
}

/// Where a finished attempt left its work item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Integrated,
    Retrying,
    Blocked,
}

pub struct ParallelExecutionCoordinator {
    storage: Arc<StorageManager>,
    work_items: Arc<WorkItemRepository>,
    instances: Arc<AgentInstanceRepository>,
    registry: Arc<SingletonRegistry>,
    mailbox: Arc<MailboxRouter>,
    workspaces: Arc<dyn WorkspaceManager>,
    launcher: Arc<dyn WorkerLauncher>,
    resolver: Arc<dyn FootprintResolver>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    settings: CoordinationSettings,
    pid: u32,
}

impl ParallelExecutionCoordinator {
    pub fn new(parts: Collaborators, settings: CoordinationSettings) -> Self {
        Self {
            work_items: parts.storage.work_items(),
            instances: parts.storage.agent_instances(),
            storage: parts.storage,
            registry: parts.registry,
            mailbox: parts.mailbox,
            workspaces: parts.workspaces,
            launcher: parts.launcher,
            resolver: parts.resolver,
            events: parts.events,
            clock: parts.clock,
            settings,
            pid: std::process::id(),
        }
    }

    pub fn settings(&self) -> &CoordinationSettings {
        &self.settings
    }

    /// Start as many ready, mutually independent candidates as capacity allows
    ///
    /// Candidates that are not schedulable right now are ignored. Items that
    /// are already executing count against `max_batch_size` and every new
    /// item must be independent of them.
    pub async fn schedule_pass(&self, candidates: &[WorkItem]) -> Result<ScheduleResult> {
        let now = self.clock.now();
        let mut result = ScheduleResult::default();
        let succeeded = self.work_items.succeeded_ids().await?;

        let mut ready = Vec::new();
        for item in candidates.iter().filter(|item| item.is_schedulable(now)) {
            if item.dependencies_satisfied(&succeeded) {
                ready.push(item.clone());
            } else {
                result.waiting_on_dependencies.push(item.id.clone());
            }
        }
        if ready.is_empty() {
            return Ok(result);
        }

        let in_flight = self.in_flight().await?;
        let occupied: Vec<WorkItemId> = in_flight.iter().map(|item| item.id.clone()).collect();
        ready.retain(|item| !occupied.contains(&item.id));

        let mut analyzed = in_flight;
        analyzed.extend(ready.iter().cloned());
        let report = analyzer::analyze(&analyzed, self.resolver.as_ref());

        for item in &ready {
            if let Some(message) = report.unanalyzable.get(&item.id) {
                if self.block_unanalyzable(item, message).await? {
                    result.blocked.push(item.id.clone());
                }
            }
        }
        ready.retain(|item| !report.unanalyzable.contains_key(&item.id));

        // Nothing is provably independent of an executing item we cannot analyze
        if let Some(unknown) = occupied
            .iter()
            .find(|id| report.unanalyzable.contains_key(*id))
        {
            warn!(
                work_item_id = %unknown,
                "Executing work item has no resolvable footprint, deferring new work"
            );
            result.deferred = ready
                .iter()
                .map(|item| DeferredItem {
                    work_item_id: item.id.clone(),
                    conflicts_with: vec![unknown.clone()],
                    paths: Vec::new(),
                })
                .collect();
            return Ok(result);
        }

        let capacity = self.settings.max_batch_size.saturating_sub(occupied.len());
        let selected = report.select_alongside(&ready, &occupied, capacity);
        result.deferred = deferred_items(&report, &ready, &occupied, &selected);
        for conflict in result.deferred.iter().filter_map(DeferredItem::conflict) {
            debug!(category = conflict.category(), error = %conflict, "Work item deferred");
        }

        if selected.is_empty() {
            debug!(
                ready = ready.len(),
                in_flight = occupied.len(),
                "No work item can start this pass"
            );
            return Ok(result);
        }

        info!(
            batch = ?selected,
            deferred = result.deferred.len(),
            in_flight = occupied.len(),
            "Batch scheduled"
        );
        self.emit(CoordinatorEvent::batch_scheduled(
            &selected,
            result.deferred.len(),
        ))
        .await;

        for id in &selected {
            let Some(item) = ready.iter().find(|item| &item.id == id) else {
                continue;
            };
            match self.start(item).await {
                Ok(Some(started)) => result.started.push(started),
                Ok(None) => {}
                Err(e) if e.is_store_unavailable() => return Err(e),
                Err(e) if e.is_claim_denied() => {
                    debug!(work_item_id = %id, role = %item.required_role, "Role busy, item waits");
                    result.claim_denied.push(id.clone());
                }
                Err(e) => {
                    warn!(work_item_id = %id, error = %e, "Work item failed to start");
                    result.failed_to_start.push(StartFailure {
                        work_item_id: id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(result)
    }

    /// Schedule from everything currently eligible in the store
    pub async fn run_pass(&self) -> Result<ScheduleResult> {
        let candidates = self.work_items.list_schedulable(self.clock.now()).await?;
        self.schedule_pass(&candidates).await
    }

    /// Poll every active instance once
    pub async fn poll_instances(&self) -> Result<PollReport> {
        let mut report = PollReport::default();
        for instance in self.instances.list_active().await? {
            let id = instance.work_item_id.clone();
            match self.poll_instance(instance, &mut report).await {
                Ok(()) => {}
                Err(e) if e.is_store_unavailable() => return Err(e),
                Err(e) => {
                    error!(work_item_id = %id, error = %e, "Failed to poll worker instance");
                    report.errors.push(format!("{}: {}", id, e));
                }
            }
        }
        Ok(report)
    }

    /// One full coordination pass
    pub async fn tick(&self) -> Result<PassReport> {
        let poll = self.poll_instances().await?;
        let schedule = self.run_pass().await?;
        let sweep = self.mailbox.sweep().await?;
        let active_instances = self.instances.count_active().await? as usize;
        let awaiting_retry = self
            .work_items
            .list_by_status(WorkItemStatus::Failed)
            .await?
            .iter()
            .filter(|item| !item.archived)
            .count();

        Ok(PassReport {
            poll,
            schedule,
            sweep,
            active_instances,
            awaiting_retry,
        })
    }

    /// Reconcile the store with reality after a coordinator restart
    ///
    /// Workers that are still alive are adopted and polled from here on.
    /// Workers that finished while nobody watched are resolved normally.
    /// Work items left assigned or running with no worker on record count
    /// as a failed attempt.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        match self.workspaces.prune().await {
            Ok(pruned) => report.pruned_workspaces = pruned,
            Err(e) => warn!(error = %e, "Failed to prune stale workspaces"),
        }

        let poll = self.poll_instances().await?;
        report.adopted = poll.running;
        report.resolved = poll.resolved();

        let active: HashSet<WorkItemId> = self
            .instances
            .list_active()
            .await?
            .into_iter()
            .map(|instance| instance.work_item_id)
            .collect();
        for item in self.in_flight().await? {
            if active.contains(&item.id) {
                continue;
            }
            warn!(
                work_item_id = %item.id,
                status = %item.status,
                "Work item has no worker on record, counting the attempt as failed"
            );
            self.apply_failure_policy(
                &item.id,
                item.required_role,
                item.attempts.max(1),
                item.status,
                Failure::Crashed("coordinator stopped before the worker was recorded".into()),
                None,
            )
            .await?;
            report.orphaned.push(item.id);
        }

        info!(
            adopted = report.adopted,
            resolved = report.resolved.len(),
            orphaned = report.orphaned.len(),
            pruned = report.pruned_workspaces,
            "Recovery complete"
        );
        Ok(report)
    }

    /// Recover, then tick every poll interval until `shutdown` resolves
    ///
    /// With `until_idle` the loop also ends once a pass finds nothing running,
    /// nothing started and nothing waiting to retry. Workers are left running
    /// on shutdown; the next start adopts them.
    pub async fn run<F>(&self, shutdown: F, until_idle: bool) -> Result<RunOutcome>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut outcome = RunOutcome {
            recovery: self.recover().await?,
            ..Default::default()
        };

        loop {
            match self.tick().await {
                Ok(report) => {
                    outcome.passes += 1;
                    if until_idle && report.is_idle() {
                        info!(passes = outcome.passes, "Nothing left to run");
                        break;
                    }
                }
                Err(e) if e.is_store_unavailable() => {
                    let fault = CoreError::StoreUnavailable(e.to_string());
                    error!(
                        category = fault.category(),
                        error = %fault,
                        "Pausing coordination"
                    );
                    tokio::select! {
                        _ = &mut shutdown => {
                            outcome.interrupted = true;
                            break;
                        }
                        _ = self.wait_for_store() => {
                            info!("Store reachable again, resuming");
                            continue;
                        }
                    }
                }
                Err(e) => return Err(e),
            }

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, leaving workers running");
                    outcome.interrupted = true;
                    break;
                }
                _ = tokio::time::sleep(self.settings.poll_interval()) => {}
            }
        }
        Ok(outcome)
    }

    /// Pairwise analysis of `ids`, or of every unfinished item when empty
    pub async fn analyze_backlog(&self, ids: &[WorkItemId]) -> Result<AnalysisReport> {
        let items = if ids.is_empty() {
            self.work_items
                .list(false)
                .await?
                .into_iter()
                .filter(|item| !item.status.is_terminal())
                .collect()
        } else {
            let mut items = Vec::with_capacity(ids.len());
            for id in ids {
                items.push(self.work_items.get(id).await?);
            }
            items
        };
        Ok(analyzer::analyze(&items, self.resolver.as_ref()))
    }

    /// Operator resolution of a blocked item
    ///
    /// Resolving marks it succeeded so dependents can run; abandoning
    /// archives it. Quarantined workspaces of the item are removed either way.
    pub async fn resolve_blocked(&self, id: &WorkItemId, abandon: bool) -> Result<WorkItem> {
        let item = self.work_items.get(id).await?;
        if item.status != WorkItemStatus::Blocked {
            return Err(AppError::BadRequest(format!(
                "work item {} is {}, only blocked items can be resolved",
                id, item.status
            )));
        }

        let changed = if abandon {
            self.work_items.archive(id, self.clock.now()).await?
        } else {
            self.work_items
                .transition(
                    id,
                    WorkItemStatus::Blocked,
                    WorkItemStatus::Succeeded,
                    self.clock.now(),
                )
                .await?
        };
        if !changed {
            return Err(AppError::BadRequest(format!(
                "work item {} changed while resolving, try again",
                id
            )));
        }

        for instance in self.instances.list_for_work_item(id).await? {
            let workspace = Workspace::of_instance(&instance);
            if workspace.exists() {
                self.teardown_quietly(&workspace).await;
            }
        }
        info!(work_item_id = %id, abandon, "Blocked work item resolved by operator");
        Ok(self.work_items.get(id).await?)
    }

    async fn in_flight(&self) -> Result<Vec<WorkItem>> {
        let mut items = self.work_items.list_by_status(WorkItemStatus::Assigned).await?;
        items.extend(self.work_items.list_by_status(WorkItemStatus::Running).await?);
        items.retain(|item| !item.archived);
        Ok(items)
    }

    async fn start(&self, item: &WorkItem) -> Result<Option<StartedInstance>> {
        let role = item.required_role;
        let grant = self.registry.claim_with_details(role, self.pid).await?;
        if let Some(previous) = &grant.reclaimed_from {
            self.emit(CoordinatorEvent::role_reclaimed(
                role,
                previous.holder_pid,
                self.pid,
            ))
            .await;
        }

        let lease = grant.lease;
        let outcome = self.launch_attempt(item, &lease).await;
        if !matches!(outcome, Ok(Some(_))) {
            self.release_quietly(&lease).await;
        }
        outcome
    }

    async fn launch_attempt(
        &self,
        item: &WorkItem,
        lease: &Lease,
    ) -> Result<Option<StartedInstance>> {
        if !self
            .work_items
            .begin_attempt(&item.id, item.status, self.clock.now())
            .await?
        {
            debug!(work_item_id = %item.id, "Work item changed underneath the pass, skipping");
            return Ok(None);
        }
        let role = item.required_role;
        let attempt = item.attempts + 1;

        let workspace = match self.workspaces.provision(item, role, attempt).await {
            Ok(workspace) => workspace,
            Err(e) => {
                self.apply_failure_policy(
                    &item.id,
                    role,
                    attempt,
                    WorkItemStatus::Assigned,
                    Failure::SpawnFailed(format!("workspace: {}", e)),
                    None,
                )
                .await?;
                return Err(e);
            }
        };

        let request = LaunchRequest {
            work_item_id: item.id.clone(),
            role,
            attempt,
            workspace_path: workspace.path.clone(),
            marker_path: workspace.marker_path(),
            log_path: workspace.log_path(),
        };
        let pid = match self.launcher.launch(&request).await {
            Ok(pid) => pid,
            Err(e) => {
                self.apply_failure_policy(
                    &item.id,
                    role,
                    attempt,
                    WorkItemStatus::Assigned,
                    Failure::SpawnFailed(e.to_string()),
                    Some(&workspace),
                )
                .await?;
                return Err(e);
            }
        };

        let instance = AgentInstance::spawned(
            Some(pid),
            role,
            item.id.clone(),
            attempt,
            workspace.path.clone(),
            workspace.branch_name.clone(),
            self.clock.now(),
        );
        if let Err(e) = self.record_launch(lease, &instance).await {
            warn!(work_item_id = %item.id, pid, error = %e, "Failed to record worker, stopping it");
            if let Err(kill) = self.launcher.terminate(pid, self.settings.kill_grace()).await {
                warn!(pid, error = %kill, "Failed to stop unrecorded worker");
            }
            if !e.is_store_unavailable() {
                self.apply_failure_policy(
                    &item.id,
                    role,
                    attempt,
                    WorkItemStatus::Assigned,
                    Failure::SpawnFailed(e.to_string()),
                    Some(&workspace),
                )
                .await?;
            }
            return Err(e);
        }

        info!(
            work_item_id = %item.id,
            %role,
            attempt,
            pid,
            branch = %workspace.branch_name,
            "Worker started"
        );
        Ok(Some(StartedInstance {
            work_item_id: item.id.clone(),
            role,
            attempt,
            instance_id: instance.id,
            pid,
            branch: workspace.branch_name,
        }))
    }

    async fn record_launch(&self, lease: &Lease, instance: &AgentInstance) -> Result<()> {
        let pid = instance.pid.unwrap_or(self.pid);
        let lease = self.registry.assign_holder(lease, pid).await?;
        self.registry.heartbeat(&lease).await?;
        self.instances.create(instance).await?;
        self.work_items
            .transition(
                &instance.work_item_id,
                WorkItemStatus::Assigned,
                WorkItemStatus::Running,
                self.clock.now(),
            )
            .await?;
        Ok(())
    }

    async fn poll_instance(&self, mut instance: AgentInstance, report: &mut PollReport) -> Result<()> {
        let now = self.clock.now();
        if instance.state == AgentState::Spawned {
            if !self
                .instances
                .update_state(instance.id, AgentState::Spawned, AgentState::Running, None)
                .await?
            {
                return Ok(());
            }
            instance.state = AgentState::Running;
            // Covers a coordinator that stopped between recording and marking
            self.work_items
                .transition(
                    &instance.work_item_id,
                    WorkItemStatus::Assigned,
                    WorkItemStatus::Running,
                    now,
                )
                .await?;
        }

        let Some(pid) = instance.pid else {
            let resolution = self
                .finish_failed(&instance, Failure::Crashed("no worker process on record".into()))
                .await?;
            record(report, &instance.work_item_id, resolution);
            return Ok(());
        };

        let resolution = match self.launcher.status(pid).await? {
            ProcessStatus::Running => {
                let timeout_seconds = self.settings.timeout_seconds_for(instance.role);
                if instance.elapsed_seconds(now) > timeout_seconds as i64 {
                    let workspace = Workspace::of_instance(&instance);
                    match read_marker(&workspace.marker_path())? {
                        Some(outcome) => {
                            info!(
                                work_item_id = %instance.work_item_id,
                                pid,
                                success = outcome.is_success(),
                                "Worker left a result but did not exit, stopping it"
                            );
                            self.terminate_quietly(pid).await;
                            self.finish_with_outcome(&instance, outcome).await?
                        }
                        None => {
                            report.hung.push(instance.work_item_id.clone());
                            self.finish_hung(&instance, pid, timeout_seconds).await?
                        }
                    }
                } else if self.keep_alive(&instance, now).await? {
                    report.running += 1;
                    return Ok(());
                } else {
                    warn!(
                        work_item_id = %instance.work_item_id,
                        role = %instance.role,
                        pid,
                        "Role lease lost, stopping worker"
                    );
                    self.terminate_quietly(pid).await;
                    self.finish_failed(&instance, Failure::Crashed("role lease lost".into()))
                        .await?
                }
            }
            ProcessStatus::Exited(code) => {
                let workspace = Workspace::of_instance(&instance);
                match read_marker(&workspace.marker_path())? {
                    Some(outcome) => self.finish_with_outcome(&instance, outcome).await?,
                    None => {
                        let reason = match code {
                            Some(code) => {
                                format!("exited with code {} without a result marker", code)
                            }
                            None => "exited without a result marker".to_string(),
                        };
                        self.finish_failed(&instance, Failure::Crashed(reason))
                            .await?
                    }
                }
            }
        };
        record(report, &instance.work_item_id, resolution);
        Ok(())
    }

    /// Heartbeat the role lease and the instance when one is due; false once
    /// the lease is no longer held by this worker
    async fn keep_alive(&self, instance: &AgentInstance, now: DateTime<Utc>) -> Result<bool> {
        let interval = Duration::seconds(self.settings.heartbeat_interval_seconds as i64);
        if now - instance.last_heartbeat < interval {
            return Ok(true);
        }
        let Some(lease) = self.lease_of(instance).await? else {
            return Ok(false);
        };
        match self.registry.heartbeat(&lease).await {
            Ok(()) => {}
            Err(e) if e.is_unavailable() => return Err(e.into()),
            Err(_) => return Ok(false),
        }
        self.instances.heartbeat(instance.id, now).await?;
        Ok(true)
    }

    async fn finish_with_outcome(
        &self,
        instance: &AgentInstance,
        outcome: WorkerOutcome,
    ) -> Result<Resolution> {
        match outcome {
            WorkerOutcome::Success => self.finish_succeeded(instance).await,
            WorkerOutcome::Failure { reason } => {
                self.finish_failed(instance, Failure::Crashed(reason)).await
            }
        }
    }

    async fn finish_succeeded(&self, instance: &AgentInstance) -> Result<Resolution> {
        let id = &instance.work_item_id;
        let role = instance.role;
        let workspace = Workspace::of_instance(instance);

        let integration = match self.workspaces.integrate(&workspace).await {
            Ok(integration) => integration,
            Err(e) => {
                warn!(work_item_id = %id, error = %e, "Integration failed");
                return self
                    .finish_failed(instance, Failure::Crashed(format!("integration failed: {}", e)))
                    .await;
            }
        };

        if integration.merged {
            self.instances
                .update_state(instance.id, AgentState::Running, AgentState::Succeeded, None)
                .await?;
            self.work_items
                .transition(
                    id,
                    WorkItemStatus::Running,
                    WorkItemStatus::Succeeded,
                    self.clock.now(),
                )
                .await?;
            self.release_lease_of(instance).await;
            self.teardown_quietly(&workspace).await;

            let commit = integration.commit.unwrap_or_default();
            info!(work_item_id = %id, %role, commit = %commit, "Work item integrated");
            self.emit(CoordinatorEvent::work_item_integrated(id, role, &commit))
                .await;
            self.notify(
                role,
                "review",
                json!({ "event": "integrated", "work_item_id": id, "commit": commit }),
                MessagePriority::Normal,
                id,
            )
            .await;
            self.instances.archive(instance.id).await?;
            return Ok(Resolution::Integrated);
        }

        let error = CoreError::MergeConflict {
            work_item_id: id.clone(),
            paths: integration.conflicts.clone(),
        };
        warn!(
            work_item_id = %id,
            %role,
            attempt = instance.attempt,
            category = error.category(),
            error = %error,
            "Workspace preserved for resolution"
        );
        let reason = BlockedReason::MergeConflict {
            paths: integration.conflicts.clone(),
        };
        self.instances
            .update_state(
                instance.id,
                AgentState::Running,
                AgentState::Succeeded,
                Some("merge conflict"),
            )
            .await?;
        self.work_items
            .block(id, WorkItemStatus::Running, &reason, self.clock.now())
            .await?;
        self.release_lease_of(instance).await;
        self.quarantine_quietly(&workspace, &reason.to_string()).await;

        self.emit(CoordinatorEvent::merge_conflict(id, role, &integration.conflicts))
            .await;
        self.emit(CoordinatorEvent::work_item_blocked(id, role, &reason))
            .await;
        self.notify(
            role,
            "triage",
            json!({
                "event": "merge_conflict",
                "work_item_id": id,
                "paths": integration.conflicts,
                "workspace": workspace.path,
            }),
            MessagePriority::High,
            id,
        )
        .await;
        self.instances.archive(instance.id).await?;
        Ok(Resolution::Blocked)
    }

    async fn finish_failed(&self, instance: &AgentInstance, failure: Failure) -> Result<Resolution> {
        let reason = failure.reason();
        self.instances
            .update_state(
                instance.id,
                AgentState::Running,
                AgentState::Failed,
                Some(&reason),
            )
            .await?;
        self.release_lease_of(instance).await;
        let resolution = self
            .apply_failure_policy(
                &instance.work_item_id,
                instance.role,
                instance.attempt,
                WorkItemStatus::Running,
                failure,
                Some(&Workspace::of_instance(instance)),
            )
            .await?;
        self.instances.archive(instance.id).await?;
        Ok(resolution)
    }

    async fn finish_hung(
        &self,
        instance: &AgentInstance,
        pid: u32,
        timeout_seconds: u64,
    ) -> Result<Resolution> {
        let failure = Failure::Hung { timeout_seconds };
        warn!(
            work_item_id = %instance.work_item_id,
            role = %instance.role,
            attempt = instance.attempt,
            pid,
            timeout_seconds,
            "Worker exceeded its role timeout"
        );
        self.instances
            .update_state(
                instance.id,
                AgentState::Running,
                AgentState::Hung,
                Some(&failure.reason()),
            )
            .await?;
        self.emit(CoordinatorEvent::instance_hung(
            &instance.work_item_id,
            instance.role,
            instance.attempt,
            timeout_seconds,
        ))
        .await;

        self.terminate_quietly(pid).await;
        self.instances
            .update_state(instance.id, AgentState::Hung, AgentState::Killed, None)
            .await?;
        self.release_lease_of(instance).await;

        let resolution = self
            .apply_failure_policy(
                &instance.work_item_id,
                instance.role,
                instance.attempt,
                WorkItemStatus::Running,
                failure,
                Some(&Workspace::of_instance(instance)),
            )
            .await?;
        self.instances.archive(instance.id).await?;
        Ok(resolution)
    }

    /// Every failed attempt moves the item to Failed; with attempts left it
    /// waits out the backoff, otherwise it is blocked and its workspace kept
    async fn apply_failure_policy(
        &self,
        id: &WorkItemId,
        role: Role,
        attempt: u32,
        from: WorkItemStatus,
        failure: Failure,
        workspace: Option<&Workspace>,
    ) -> Result<Resolution> {
        let retry = &self.settings.retry;
        let will_retry = retry.has_attempts_left(attempt);
        let error = failure.error(id);
        let now = self.clock.now();
        let next_attempt_at = now + retry.delay_for_attempt(attempt);
        warn!(
            work_item_id = %id,
            %role,
            attempt,
            category = error.category(),
            recoverable = error.is_recoverable(),
            error = %error,
            "Worker attempt failed"
        );

        if !self
            .work_items
            .record_failure(id, from, next_attempt_at, now)
            .await?
        {
            warn!(work_item_id = %id, %from, "Work item changed before the failure was recorded");
        }
        self.emit(CoordinatorEvent::instance_failed(
            id,
            role,
            attempt,
            &failure.reason(),
            error.category(),
            will_retry,
        ))
        .await;

        if will_retry {
            info!(
                work_item_id = %id,
                attempt,
                next_attempt_at = %next_attempt_at,
                "Retry scheduled"
            );
            if let Some(workspace) = workspace {
                self.teardown_quietly(workspace).await;
            }
            return Ok(Resolution::Retrying);
        }

        let blocked = failure.blocked_reason(attempt);
        self.work_items
            .block(id, WorkItemStatus::Failed, &blocked, now)
            .await?;
        warn!(work_item_id = %id, reason = %blocked, "Work item blocked");
        if let Some(workspace) = workspace {
            self.quarantine_quietly(workspace, &blocked.to_string()).await;
        }
        self.emit(CoordinatorEvent::work_item_blocked(id, role, &blocked))
            .await;
        self.notify(
            role,
            "triage",
            json!({
                "event": "blocked",
                "work_item_id": id,
                "reason": blocked,
                "summary": blocked.to_string(),
            }),
            MessagePriority::High,
            id,
        )
        .await;
        Ok(Resolution::Blocked)
    }

    async fn block_unanalyzable(&self, item: &WorkItem, message: &str) -> Result<bool> {
        let reason = BlockedReason::Unanalyzable {
            message: message.to_string(),
        };
        if !self
            .work_items
            .block(&item.id, item.status, &reason, self.clock.now())
            .await?
        {
            return Ok(false);
        }
        warn!(work_item_id = %item.id, error = %message, "Footprint unresolvable, work item blocked");
        self.emit(CoordinatorEvent::work_item_blocked(
            &item.id,
            item.required_role,
            &reason,
        ))
        .await;
        self.notify(
            item.required_role,
            "triage",
            json!({
                "event": "blocked",
                "work_item_id": item.id,
                "reason": reason,
                "summary": reason.to_string(),
            }),
            MessagePriority::High,
            &item.id,
        )
        .await;
        Ok(true)
    }

    /// The lease for the instance's role, if the instance's worker still holds it
    async fn lease_of(&self, instance: &AgentInstance) -> Result<Option<Lease>> {
        Ok(self
            .registry
            .current_lease(instance.role)
            .await?
            .filter(|lease| Some(lease.holder_pid) == instance.pid))
    }

    async fn release_lease_of(&self, instance: &AgentInstance) {
        match self.lease_of(instance).await {
            Ok(Some(lease)) => self.release_quietly(&lease).await,
            Ok(None) => debug!(role = %instance.role, "No lease left to release"),
            Err(e) => warn!(role = %instance.role, error = %e, "Failed to look up role lease"),
        }
    }

    async fn release_quietly(&self, lease: &Lease) {
        if let Err(e) = self.registry.release(lease).await {
            warn!(role = %lease.role, error = %e, "Failed to release role lease");
        }
    }

    async fn terminate_quietly(&self, pid: u32) {
        if let Err(e) = self.launcher.terminate(pid, self.settings.kill_grace()).await {
            warn!(pid, error = %e, "Failed to terminate worker");
        }
    }

    async fn teardown_quietly(&self, workspace: &Workspace) {
        if let Err(e) = self.workspaces.teardown(workspace).await {
            warn!(
                work_item_id = %workspace.work_item_id,
                path = %workspace.path.display(),
                error = %e,
                "Failed to tear down workspace"
            );
        }
    }

    async fn quarantine_quietly(&self, workspace: &Workspace, reason: &str) {
        if let Err(e) = self.workspaces.quarantine(workspace, reason).await {
            warn!(
                work_item_id = %workspace.work_item_id,
                error = %e,
                "Failed to quarantine workspace"
            );
        }
    }

    async fn emit(&self, event: CoordinatorEvent) {
        if let Err(e) = self.events.emit(&event).await {
            warn!(kind = %event.kind, error = %e, "Failed to record coordinator event");
        }
    }

    /// Best-effort routed notification; a missing route only drops it
    async fn notify(
        &self,
        from_role: Role,
        intent: &str,
        payload: serde_json::Value,
        priority: MessagePriority,
        work_item_id: &WorkItemId,
    ) {
        match self
            .mailbox
            .send_routed(
                from_role,
                intent,
                &payload.to_string(),
                priority,
                Some(work_item_id),
            )
            .await
        {
            Ok(routed) => debug!(
                %intent,
                to = %routed.to_role,
                via_fallback = routed.routed_via_fallback,
                "Notification queued"
            ),
            Err(conductor_storage::Error::Core(e)) if e.is_not_found() => {
                debug!(%intent, "No route for notification, dropped")
            }
            Err(e) => warn!(%intent, error = %e, "Failed to queue notification"),
        }
    }

    async fn wait_for_store(&self) {
        let mut delay = std::time::Duration::from_secs(1);
        loop {
            tokio::time::sleep(delay).await;
            match self.storage.health_check().await {
                Ok(()) => return,
                Err(e) => debug!(error = %e, retry_in = ?delay, "Store still unavailable"),
            }
            delay = (delay * 2).min(MAX_STORE_BACKOFF);
        }
    }
}

fn record(report: &mut PollReport, id: &WorkItemId, resolution: Resolution) {
    let bucket = match resolution {
        Resolution::Integrated => &mut report.integrated,
        Resolution::Retrying => &mut report.retrying,
        Resolution::Blocked => &mut report.blocked,
    };
    bucket.push(id.clone());
}

fn deferred_items(
    report: &AnalysisReport,
    ready: &[WorkItem],
    occupied: &[WorkItemId],
    selected: &[WorkItemId],
) -> Vec<DeferredItem> {
    ready
        .iter()
        .filter(|item| !selected.contains(&item.id))
        .map(|item| {
            let mut conflicts_with = Vec::new();
            let mut paths = BTreeSet::new();
            for (other, shared) in report.conflicts_of(&item.id) {
                if occupied.contains(&other) || selected.contains(&other) {
                    conflicts_with.push(other);
                    paths.extend(shared);
                }
            }
            DeferredItem {
                work_item_id: item.id.clone(),
                conflicts_with,
                paths: paths.into_iter().collect(),
            }
        })
        .collect()
}
