//! Structured coordinator events
//!
//! Every scheduling decision worth auditing is emitted as a
//! [`CoordinatorEvent`] through an [`EventSink`]. The default sink persists
//! to the `events` table; a broadcast sink feeds in-process subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use conductor_core::work_item::{BlockedReason, Role, WorkItemId};

pub mod sink;

pub use sink::{BroadcastEventSink, EventSink, FanoutEventSink, StoreEventSink};

/// Event kinds in the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    BatchScheduled,
    InstanceFailed,
    InstanceHung,
    RoleReclaimed,
    MergeConflict,
    WorkItemIntegrated,
    WorkItemBlocked,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::BatchScheduled => "batch_scheduled",
            EventKind::InstanceFailed => "instance_failed",
            EventKind::InstanceHung => "instance_hung",
            EventKind::RoleReclaimed => "role_reclaimed",
            EventKind::MergeConflict => "merge_conflict",
            EventKind::WorkItemIntegrated => "work_item_integrated",
            EventKind::WorkItemBlocked => "work_item_blocked",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorEvent {
    pub kind: EventKind,
    pub work_item_id: Option<WorkItemId>,
    pub role: Option<Role>,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl CoordinatorEvent {
    fn new(
        kind: EventKind,
        work_item_id: Option<&WorkItemId>,
        role: Option<Role>,
        payload: Value,
    ) -> Self {
        Self {
            kind,
            work_item_id: work_item_id.cloned(),
            role,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn batch_scheduled(work_item_ids: &[WorkItemId], deferred: usize) -> Self {
        Self::new(
            EventKind::BatchScheduled,
            None,
            None,
            json!({ "work_item_ids": work_item_ids, "deferred": deferred }),
        )
    }

    pub fn instance_failed(
        work_item_id: &WorkItemId,
        role: Role,
        attempt: u32,
        reason: &str,
        category: &str,
        will_retry: bool,
    ) -> Self {
        Self::new(
            EventKind::InstanceFailed,
            Some(work_item_id),
            Some(role),
            json!({
                "attempt": attempt,
                "reason": reason,
                "category": category,
                "will_retry": will_retry,
            }),
        )
    }

    pub fn instance_hung(
        work_item_id: &WorkItemId,
        role: Role,
        attempt: u32,
        timeout_seconds: u64,
    ) -> Self {
        Self::new(
            EventKind::InstanceHung,
            Some(work_item_id),
            Some(role),
            json!({ "attempt": attempt, "timeout_seconds": timeout_seconds }),
        )
    }

    pub fn role_reclaimed(role: Role, previous_pid: u32, new_pid: u32) -> Self {
        Self::new(
            EventKind::RoleReclaimed,
            None,
            Some(role),
            json!({ "previous_pid": previous_pid, "new_pid": new_pid }),
        )
    }

    pub fn merge_conflict(work_item_id: &WorkItemId, role: Role, paths: &[String]) -> Self {
        Self::new(
            EventKind::MergeConflict,
            Some(work_item_id),
            Some(role),
            json!({ "paths": paths }),
        )
    }

    pub fn work_item_integrated(work_item_id: &WorkItemId, role: Role, commit: &str) -> Self {
        Self::new(
            EventKind::WorkItemIntegrated,
            Some(work_item_id),
            Some(role),
            json!({ "commit": commit }),
        )
    }

    pub fn work_item_blocked(work_item_id: &WorkItemId, role: Role, reason: &BlockedReason) -> Self {
        Self::new(
            EventKind::WorkItemBlocked,
            Some(work_item_id),
            Some(role),
            json!({ "reason": reason, "summary": reason.to_string() }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_names() {
        assert_eq!(EventKind::BatchScheduled.to_string(), "batch_scheduled");
        assert_eq!(
            serde_json::to_value(EventKind::WorkItemIntegrated).unwrap(),
            json!("work_item_integrated")
        );
    }

    #[test]
    fn test_blocked_event_carries_reason() {
        let id = WorkItemId::new("WI-7");
        let reason = BlockedReason::MergeConflict {
            paths: vec!["x.py".to_string()],
        };
        let event = CoordinatorEvent::work_item_blocked(&id, Role::Coder, &reason);

        assert_eq!(event.kind, EventKind::WorkItemBlocked);
        assert_eq!(event.work_item_id, Some(id));
        assert_eq!(event.payload["reason"]["kind"], "merge_conflict");
        assert_eq!(event.payload["reason"]["paths"][0], "x.py");
    }
}
