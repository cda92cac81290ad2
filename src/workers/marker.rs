//! Terminal result marker written by a worker before it exits
//!
//! The file holds `{"status":"success"}` or
//! `{"status":"failure","reason":"..."}`. The exit code alone is never
//! trusted, so a worker that exits without a marker counts as crashed.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerOutcome {
    Success,
    Failure {
        #[serde(default)]
        reason: String,
    },
}

impl WorkerOutcome {
    pub fn failure<S: Into<String>>(reason: S) -> Self {
        WorkerOutcome::Failure {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, WorkerOutcome::Success)
    }
}

/// Read the marker; `None` when the worker never wrote one
pub fn read_marker(path: &Path) -> Result<Option<WorkerOutcome>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_str(raw.trim()) {
        Ok(outcome) => Ok(Some(outcome)),
        Err(e) => {
            warn!(path = %path.display(), "Unreadable result marker: {}", e);
            Ok(Some(WorkerOutcome::failure(format!(
                "malformed result marker: {}",
                e
            ))))
        }
    }
}

/// Write a marker atomically through a temporary sibling file
pub fn write_marker(path: &Path, outcome: &WorkerOutcome) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec(outcome)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub fn clear_marker(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
