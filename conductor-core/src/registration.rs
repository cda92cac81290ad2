//! Per-role singleton registrations
//!
//! Each role has at most one row. The row's lease token is its version: every
//! takeover, heartbeat and release is a compare-and-swap on that token.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::work_item::Role;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleRegistration {
    pub role: Role,
    pub holder_pid: u32,
    pub lease_token: Uuid,
    pub claimed_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
}

impl RoleRegistration {
    /// Staleness is measured from the last heartbeat, or from the claim when
    /// no heartbeat ever arrived
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_heartbeat.unwrap_or(self.claimed_at)
    }

    pub fn is_released(&self) -> bool {
        self.released_at.is_some()
    }

    pub fn is_stale(&self, now: DateTime<Utc>, staleness_timeout: Duration) -> bool {
        now - self.last_seen() > staleness_timeout
    }

    pub fn state(&self, now: DateTime<Utc>, staleness_timeout: Duration) -> RegistrationState {
        if self.is_released() {
            RegistrationState::Released
        } else if !self.is_stale(now, staleness_timeout) {
            RegistrationState::Claimed
        } else if self.last_heartbeat.is_some() {
            RegistrationState::Reclaimable
        } else {
            RegistrationState::Unclaimed
        }
    }

    pub fn lease(&self) -> Lease {
        Lease {
            role: self.role,
            token: self.lease_token,
            holder_pid: self.holder_pid,
            claimed_at: self.claimed_at,
        }
    }
}

/// Proof of holding a role; required for heartbeat and release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub role: Role,
    pub token: Uuid,
    pub holder_pid: u32,
    pub claimed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationState {
    Unclaimed,
    Claimed,
    Reclaimable,
    Released,
}

impl RegistrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationState::Unclaimed => "unclaimed",
            RegistrationState::Claimed => "claimed",
            RegistrationState::Reclaimable => "reclaimable",
            RegistrationState::Released => "released",
        }
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
