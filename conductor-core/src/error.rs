//! Error types for the core domain

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::work_item::{Role, WorkItemId};

/// Core error type for domain and scheduling operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("UUID parsing error: {0}")]
    UuidParse(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("State transition error: {message}")]
    StateTransition { message: String },

    #[error("Footprint unavailable for {work_item_id}: {message}")]
    FootprintUnavailable {
        work_item_id: WorkItemId,
        message: String,
    },

    #[error("Conflict detected between {first} and {second} on {paths:?}")]
    ConflictDetected {
        first: WorkItemId,
        second: WorkItemId,
        paths: Vec<String>,
    },

    #[error("Claim denied for role {role}: held by pid {holder_pid} since {claimed_at}")]
    ClaimDenied {
        role: Role,
        holder_pid: u32,
        claimed_at: DateTime<Utc>,
    },

    #[error("Lease lost for role {role}")]
    LeaseLost { role: Role },

    #[error("Agent spawn failed for {work_item_id}: {message}")]
    AgentSpawnFailed {
        work_item_id: WorkItemId,
        message: String,
    },

    #[error("Agent hung on {work_item_id} after {timeout_seconds}s")]
    AgentHung {
        work_item_id: WorkItemId,
        timeout_seconds: u64,
    },

    #[error("Agent crashed on {work_item_id}: {reason}")]
    AgentCrashed {
        work_item_id: WorkItemId,
        reason: String,
    },

    #[error("Merge conflict integrating {work_item_id}: {paths:?}")]
    MergeConflict {
        work_item_id: WorkItemId,
        paths: Vec<String>,
    },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<uuid::Error> for Error {
    fn from(err: uuid::Error) -> Self {
        Error::UuidParse(err.to_string())
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl Error {
    /// Create a validation error with a formatted message
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a not found error for a specific entity type and ID
    pub fn not_found<S1: Into<String>, S2: Into<String>>(entity_type: S1, id: S2) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a state transition error
    pub fn state_transition<S: Into<String>>(message: S) -> Self {
        Self::StateTransition {
            message: message.into(),
        }
    }

    pub fn footprint_unavailable<S: Into<String>>(work_item_id: &WorkItemId, message: S) -> Self {
        Self::FootprintUnavailable {
            work_item_id: work_item_id.clone(),
            message: message.into(),
        }
    }

    pub fn spawn_failed<S: Into<String>>(work_item_id: &WorkItemId, message: S) -> Self {
        Self::AgentSpawnFailed {
            work_item_id: work_item_id.clone(),
            message: message.into(),
        }
    }

    pub fn crashed<S: Into<String>>(work_item_id: &WorkItemId, reason: S) -> Self {
        Self::AgentCrashed {
            work_item_id: work_item_id.clone(),
            reason: reason.into(),
        }
    }

    /// Check if this error is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Check if this error is expected contention that the next pass retries
    pub fn is_claim_denied(&self) -> bool {
        matches!(self, Error::ClaimDenied { .. })
    }

    /// Check if this error is recoverable without operator involvement
    ///
    /// Merge conflicts need a human and a missing store halts the pass, so
    /// neither counts.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::ConflictDetected { .. }
                | Error::ClaimDenied { .. }
                | Error::AgentSpawnFailed { .. }
                | Error::AgentHung { .. }
                | Error::AgentCrashed { .. }
        )
    }

    /// Get the error category for logging and events
    pub fn category(&self) -> &'static str {
        match self {
            Error::Validation { .. } => "validation",
            Error::NotFound { .. } => "not_found",
            Error::Serialization(_) => "serialization",
            Error::UuidParse(_) => "uuid_parse",
            Error::Internal(_) => "internal",
            Error::Configuration { .. } => "configuration",
            Error::StateTransition { .. } => "state_transition",
            Error::FootprintUnavailable { .. } => "footprint_unavailable",
            Error::ConflictDetected { .. } => "conflict_detected",
            Error::ClaimDenied { .. } => "claim_denied",
            Error::LeaseLost { .. } => "lease_lost",
            Error::AgentSpawnFailed { .. } => "agent_spawn_failed",
            Error::AgentHung { .. } => "agent_hung",
            Error::AgentCrashed { .. } => "agent_crashed",
            Error::MergeConflict { .. } => "merge_conflict",
            Error::StoreUnavailable(_) => "store_unavailable",
        }
    }
}

/// Convenience result type for core operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let not_found_err = Error::not_found("WorkItem", "wi-1");
        assert!(not_found_err.is_not_found());
        assert_eq!(not_found_err.category(), "not_found");

        let denied = Error::ClaimDenied {
            role: Role::Coder,
            holder_pid: 42,
            claimed_at: Utc::now(),
        };
        assert!(denied.is_claim_denied());
        assert!(denied.is_recoverable());
        assert_eq!(denied.category(), "claim_denied");
    }

    #[test]
    fn test_error_recoverability() {
        let id = WorkItemId::new("wi-1");
        assert!(Error::spawn_failed(&id, "no such file").is_recoverable());
        assert!(Error::crashed(&id, "exit 1").is_recoverable());
        assert!(Error::AgentHung {
            work_item_id: id.clone(),
            timeout_seconds: 60
        }
        .is_recoverable());

        assert!(!Error::MergeConflict {
            work_item_id: id,
            paths: vec!["x.py".into()]
        }
        .is_recoverable());
        assert!(!Error::StoreUnavailable("locked".into()).is_recoverable());
        assert!(!Error::validation("bad").is_recoverable());
    }

    #[test]
    fn test_error_from_conversions() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let core_err: Error = json_err.into();
        assert_eq!(core_err.category(), "serialization");

        let uuid_err = uuid::Uuid::parse_str("invalid-uuid").unwrap_err();
        let core_err: Error = uuid_err.into();
        assert_eq!(core_err.category(), "uuid_parse");
    }

    #[test]
    fn test_error_display() {
        let err = Error::MergeConflict {
            work_item_id: WorkItemId::new("wi-7"),
            paths: vec!["src/lib.rs".into()],
        };
        let display_str = format!("{}", err);
        assert!(display_str.contains("Merge conflict"));
        assert!(display_str.contains("wi-7"));
        assert!(display_str.contains("src/lib.rs"));
    }
}
