//! What a coordinator pass did, in a shape the CLI can print or serialize

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use conductor_core::analyzer::{AnalysisReport, ConflictEdge};
use conductor_core::work_item::{Role, WorkItemId};
use conductor_storage::services::SweepReport;

#[derive(Debug, Clone, Serialize)]
pub struct StartedInstance {
    pub work_item_id: WorkItemId,
    pub role: Role,
    pub attempt: u32,
    pub instance_id: Uuid,
    pub pid: u32,
    pub branch: String,
}

/// A ready item left for a later pass
///
/// `conflicts_with` is empty when the item was only held back by the batch
/// size limit.
#[derive(Debug, Clone, Serialize)]
pub struct DeferredItem {
    pub work_item_id: WorkItemId,
    pub conflicts_with: Vec<WorkItemId>,
    pub paths: Vec<String>,
}

impl DeferredItem {
    /// The conflict that held this item back, if it was not just capacity
    pub fn conflict(&self) -> Option<conductor_core::Error> {
        let first = self.conflicts_with.first()?;
        Some(conductor_core::Error::ConflictDetected {
            first: self.work_item_id.clone(),
            second: first.clone(),
            paths: self.paths.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StartFailure {
    pub work_item_id: WorkItemId,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScheduleResult {
    pub started: Vec<StartedInstance>,
    pub waiting_on_dependencies: Vec<WorkItemId>,
    pub deferred: Vec<DeferredItem>,
    /// Role held elsewhere; retried on the next pass without counting an attempt
    pub claim_denied: Vec<WorkItemId>,
    pub failed_to_start: Vec<StartFailure>,
    /// Footprint could not be resolved
    pub blocked: Vec<WorkItemId>,
}

impl ScheduleResult {
    pub fn started_ids(&self) -> Vec<WorkItemId> {
        self.started.iter().map(|s| s.work_item_id.clone()).collect()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PollReport {
    pub running: usize,
    pub integrated: Vec<WorkItemId>,
    pub retrying: Vec<WorkItemId>,
    pub blocked: Vec<WorkItemId>,
    pub hung: Vec<WorkItemId>,
    pub errors: Vec<String>,
}

impl PollReport {
    /// Items whose instance reached a terminal state during the poll
    pub fn resolved(&self) -> Vec<WorkItemId> {
        self.integrated
            .iter()
            .chain(self.retrying.iter())
            .chain(self.blocked.iter())
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PassReport {
    pub poll: PollReport,
    pub schedule: ScheduleResult,
    pub sweep: SweepReport,
    pub active_instances: usize,
    pub awaiting_retry: usize,
}

impl PassReport {
    /// No worker alive, nothing started and nothing waiting out a backoff
    pub fn is_idle(&self) -> bool {
        self.active_instances == 0
            && self.awaiting_retry == 0
            && self.schedule.started.is_empty()
            && self.schedule.claim_denied.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    /// Live workers from a previous coordinator picked up again
    pub adopted: usize,
    /// Instances that had finished while nobody was watching
    pub resolved: Vec<WorkItemId>,
    /// Assigned or running items with no worker on record
    pub orphaned: Vec<WorkItemId>,
    pub pruned_workspaces: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunOutcome {
    pub recovery: RecoveryReport,
    pub passes: u64,
    pub interrupted: bool,
}

/// Serializable view of an [`AnalysisReport`]
#[derive(Debug, Clone, Serialize)]
pub struct BacklogAnalysis {
    pub footprints: BTreeMap<WorkItemId, Vec<String>>,
    pub conflicts: Vec<ConflictEdge>,
    pub independent_pairs: Vec<(WorkItemId, WorkItemId)>,
    pub low_confidence: BTreeSet<WorkItemId>,
    pub unanalyzable: BTreeMap<WorkItemId, String>,
}

impl From<&AnalysisReport> for BacklogAnalysis {
    fn from(report: &AnalysisReport) -> Self {
        Self {
            footprints: report.footprint_map.clone(),
            conflicts: report.conflict_edges(),
            independent_pairs: report.independent_pairs.clone(),
            low_confidence: report.low_confidence.clone(),
            unanalyzable: report.unanalyzable.clone(),
        }
    }
}
