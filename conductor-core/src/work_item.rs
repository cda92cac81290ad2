//! Work item domain model
//!
//! A work item is one unit of change authored against the shared source
//! tree. The coordinator is the only writer of its status and every status
//! change is checked against [`WorkItemStatus::can_transition_to`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::{Error, Result};

/// Maximum length of a work item identifier
pub const MAX_ID_LENGTH: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItemId(String);

impl WorkItemId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    /// Validate an identifier coming from outside the process
    pub fn parse(id: &str) -> Result<Self> {
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(Error::validation("Work item id cannot be empty"));
        }
        if trimmed.len() > MAX_ID_LENGTH {
            return Err(Error::validation(format!(
                "Work item id cannot exceed {} characters",
                MAX_ID_LENGTH
            )));
        }
        if !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(Error::validation(format!(
                "Work item id '{}' may only contain ASCII letters, digits, '-', '_' and '.'",
                trimmed
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Worker roles; at most one live worker holds each role at a time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Planner,
    Coder,
    Reviewer,
    Tester,
    Integrator,
    Documenter,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::Planner,
        Role::Coder,
        Role::Reviewer,
        Role::Tester,
        Role::Integrator,
        Role::Documenter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Planner => "planner",
            Role::Coder => "coder",
            Role::Reviewer => "reviewer",
            Role::Tester => "tester",
            Role::Integrator => "integrator",
            Role::Documenter => "documenter",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Role::ALL
            .iter()
            .copied()
            .find(|role| role.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::validation(format!("Unknown role '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Pending,
    Assigned,
    Running,
    Succeeded,
    Failed,
    Blocked,
}

impl WorkItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkItemStatus::Pending => "pending",
            WorkItemStatus::Assigned => "assigned",
            WorkItemStatus::Running => "running",
            WorkItemStatus::Succeeded => "succeeded",
            WorkItemStatus::Failed => "failed",
            WorkItemStatus::Blocked => "blocked",
        }
    }

    /// Allowed forward moves. `Blocked -> Succeeded` is the operator
    /// resolution path; the coordinator itself never leaves `Blocked`.
    pub fn can_transition_to(&self, next: WorkItemStatus) -> bool {
        use WorkItemStatus::*;
        matches!(
            (self, next),
            (Pending, Assigned)
                | (Pending, Blocked)
                | (Assigned, Running)
                | (Assigned, Failed)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Blocked)
                | (Failed, Assigned)
                | (Failed, Blocked)
                | (Blocked, Succeeded)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkItemStatus::Succeeded | WorkItemStatus::Blocked)
    }

    /// Assigned or Running, i.e. a worker may be alive for it
    pub fn is_in_flight(&self) -> bool {
        matches!(self, WorkItemStatus::Assigned | WorkItemStatus::Running)
    }
}

impl fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkItemStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(WorkItemStatus::Pending),
            "assigned" => Ok(WorkItemStatus::Assigned),
            "running" => Ok(WorkItemStatus::Running),
            "succeeded" => Ok(WorkItemStatus::Succeeded),
            "failed" => Ok(WorkItemStatus::Failed),
            "blocked" => Ok(WorkItemStatus::Blocked),
            other => Err(Error::validation(format!(
                "Unknown work item status '{}'",
                other
            ))),
        }
    }
}

/// Why a work item stopped being scheduled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockedReason {
    MergeConflict { paths: Vec<String> },
    SpawnFailed { message: String, attempts: u32 },
    Crashed { reason: String, attempts: u32 },
    Hung { attempts: u32 },
    Unanalyzable { message: String },
    Abandoned,
}

impl fmt::Display for BlockedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockedReason::MergeConflict { paths } => {
                write!(f, "merge conflict in {}", paths.join(", "))
            }
            BlockedReason::SpawnFailed { message, attempts } => {
                write!(f, "worker failed to start {} time(s): {}", attempts, message)
            }
            BlockedReason::Crashed { reason, attempts } => {
                write!(f, "worker failed after {} attempt(s): {}", attempts, reason)
            }
            BlockedReason::Hung { attempts } => {
                write!(f, "worker hung after {} attempt(s)", attempts)
            }
            BlockedReason::Unanalyzable { message } => {
                write!(f, "footprint could not be resolved: {}", message)
            }
            BlockedReason::Abandoned => f.write_str("abandoned by operator"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub title: String,
    pub declared_footprint: BTreeSet<String>,
    pub status: WorkItemStatus,
    pub required_role: Role,
    pub dependencies: BTreeSet<WorkItemId>,
    pub priority: i64,
    pub spec_path: Option<PathBuf>,
    pub attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub blocked_reason: Option<BlockedReason>,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn builder() -> WorkItemBuilder {
        WorkItemBuilder::new()
    }

    /// Move to `next`, rejecting anything the status machine does not allow
    pub fn transition_to(&mut self, next: WorkItemStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::state_transition(format!(
                "Work item {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn dependencies_satisfied(&self, succeeded: &HashSet<WorkItemId>) -> bool {
        self.dependencies.iter().all(|dep| succeeded.contains(dep))
    }

    /// Pending items are always eligible; failed items once their backoff elapsed
    pub fn is_schedulable(&self, now: DateTime<Utc>) -> bool {
        if self.archived {
            return false;
        }
        match self.status {
            WorkItemStatus::Pending => true,
            WorkItemStatus::Failed => self.next_attempt_at.map_or(true, |at| at <= now),
            _ => false,
        }
    }
}

/// Builder for creating WorkItem instances
#[derive(Debug, Default)]
pub struct WorkItemBuilder {
    id: Option<String>,
    title: Option<String>,
    footprint: BTreeSet<String>,
    role: Option<Role>,
    dependencies: BTreeSet<WorkItemId>,
    priority: i64,
    spec_path: Option<PathBuf>,
}

impl WorkItemBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn title<S: Into<String>>(mut self, title: S) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn footprint<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.footprint.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    pub fn depends_on<S: Into<String>>(mut self, id: S) -> Self {
        self.dependencies.insert(WorkItemId::new(id));
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn spec_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.spec_path = Some(path.into());
        self
    }

    pub fn build(self) -> Result<WorkItem> {
        let id = WorkItemId::parse(
            self.id
                .as_deref()
                .ok_or_else(|| Error::validation("Work item id is required"))?,
        )?;
        let required_role = self
            .role
            .ok_or_else(|| Error::validation("Work item role is required"))?;
        if self.dependencies.contains(&id) {
            return Err(Error::validation(format!(
                "Work item {} cannot depend on itself",
                id
            )));
        }

        let now = Utc::now();
        Ok(WorkItem {
            title: self.title.unwrap_or_else(|| id.to_string()),
            id,
            declared_footprint: self.footprint,
            status: WorkItemStatus::Pending,
            required_role,
            dependencies: self.dependencies,
            priority: self.priority,
            spec_path: self.spec_path,
            attempts: 0,
            next_attempt_at: None,
            blocked_reason: None,
            archived: false,
            created_at: now,
            updated_at: now,
        })
    }
}
