//! Running worker instances

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

use crate::work_item::{Role, WorkItemId};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Spawned,
    Running,
    Succeeded,
    Failed,
    Hung,
    Killed,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Spawned => "spawned",
            AgentState::Running => "running",
            AgentState::Succeeded => "succeeded",
            AgentState::Failed => "failed",
            AgentState::Hung => "hung",
            AgentState::Killed => "killed",
        }
    }

    /// Spawned or Running; the coordinator still polls it
    pub fn is_active(&self) -> bool {
        matches!(self, AgentState::Spawned | AgentState::Running)
    }

    pub fn can_transition_to(&self, next: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, next),
            (Spawned, Running)
                | (Spawned, Succeeded)
                | (Spawned, Failed)
                | (Spawned, Hung)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Hung)
                | (Hung, Killed)
        )
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "spawned" => Ok(AgentState::Spawned),
            "running" => Ok(AgentState::Running),
            "succeeded" => Ok(AgentState::Succeeded),
            "failed" => Ok(AgentState::Failed),
            "hung" => Ok(AgentState::Hung),
            "killed" => Ok(AgentState::Killed),
            other => Err(Error::validation(format!("Unknown agent state '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInstance {
    pub id: Uuid,
    pub pid: Option<u32>,
    pub role: Role,
    pub work_item_id: WorkItemId,
    pub attempt: u32,
    pub workspace_path: PathBuf,
    pub branch_name: String,
    pub state: AgentState,
    pub exit_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub archived: bool,
}

impl AgentInstance {
    pub fn spawned(
        pid: Option<u32>,
        role: Role,
        work_item_id: WorkItemId,
        attempt: u32,
        workspace_path: PathBuf,
        branch_name: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            pid,
            role,
            work_item_id,
            attempt,
            workspace_path,
            branch_name,
            state: AgentState::Spawned,
            exit_reason: None,
            started_at: now,
            last_heartbeat: now,
            archived: false,
        }
    }

    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.started_at).num_seconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine() {
        assert!(AgentState::Spawned.can_transition_to(AgentState::Running));
        assert!(AgentState::Running.can_transition_to(AgentState::Hung));
        assert!(AgentState::Hung.can_transition_to(AgentState::Killed));
        assert!(!AgentState::Succeeded.can_transition_to(AgentState::Running));
        assert!(!AgentState::Killed.can_transition_to(AgentState::Running));
        assert!(AgentState::Running.is_active());
        assert!(!AgentState::Hung.is_active());
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            AgentState::Spawned,
            AgentState::Running,
            AgentState::Succeeded,
            AgentState::Failed,
            AgentState::Hung,
            AgentState::Killed,
        ] {
            assert_eq!(state.as_str().parse::<AgentState>().unwrap(), state);
        }
    }

    #[test]
    fn test_elapsed() {
        let t0 = Utc::now();
        let instance = AgentInstance::spawned(
            Some(10),
            Role::Coder,
            WorkItemId::new("wi-1"),
            1,
            PathBuf::from("/tmp/ws"),
            "conductor/wi-1-1".into(),
            t0,
        );
        assert_eq!(instance.elapsed_seconds(t0 + chrono::Duration::seconds(90)), 90);
        assert_eq!(instance.state, AgentState::Spawned);
    }
}
