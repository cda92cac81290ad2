//! Per-role singleton registry
//!
//! A role is held through a lease. Claims insert the role row if it is
//! absent, or take over an existing row by compare-and-swap on its lease
//! token once the holder is stale and verified gone. Two racing claimants
//! can never both win: at most one `INSERT ... ON CONFLICT DO NOTHING` or
//! token-guarded `UPDATE` affects the row.

use chrono::Duration;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::repositories::RegistrationRepository;
use crate::{Error, Result};
use conductor_core::clock::{Clock, ProcessProbe};
use conductor_core::registration::{Lease, RegistrationState, RoleRegistration};
use conductor_core::work_item::Role;

/// Attempts before a claim gives up on a row that keeps changing underneath it
const MAX_CLAIM_ROUNDS: usize = 3;

/// A successful claim, with the registration it displaced if any
#[derive(Debug, Clone)]
pub struct ClaimGrant {
    pub lease: Lease,
    pub reclaimed_from: Option<RoleRegistration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoleStatus {
    pub registration: RoleRegistration,
    pub state: RegistrationState,
    pub holder_alive: bool,
}

enum Verdict {
    Deny,
    Take { reclaim: bool },
}

pub struct SingletonRegistry {
    repository: Arc<RegistrationRepository>,
    clock: Arc<dyn Clock>,
    probe: Arc<dyn ProcessProbe>,
    staleness_timeout: Duration,
    reclaim_grace: Duration,
}

impl SingletonRegistry {
    pub fn new(
        repository: Arc<RegistrationRepository>,
        clock: Arc<dyn Clock>,
        probe: Arc<dyn ProcessProbe>,
        staleness_timeout: Duration,
        reclaim_grace: Duration,
    ) -> Self {
        Self {
            repository,
            clock,
            probe,
            staleness_timeout,
            reclaim_grace,
        }
    }

    pub fn staleness_timeout(&self) -> Duration {
        self.staleness_timeout
    }

    /// Claim `role` for process `pid`
    pub async fn claim(&self, role: Role, pid: u32) -> Result<Lease> {
        self.claim_with_details(role, pid).await.map(|g| g.lease)
    }

    pub async fn claim_with_details(&self, role: Role, pid: u32) -> Result<ClaimGrant> {
        let now = self.clock.now();
        let fresh = RoleRegistration {
            role,
            holder_pid: pid,
            lease_token: Uuid::new_v4(),
            claimed_at: now,
            last_heartbeat: None,
            released_at: None,
        };

        let mut last_seen = None;
        for _ in 0..MAX_CLAIM_ROUNDS {
            if self.repository.insert_if_absent(&fresh).await? {
                info!(%role, pid, "Role claimed");
                return Ok(ClaimGrant {
                    lease: fresh.lease(),
                    reclaimed_from: None,
                });
            }

            let Some(current) = self.repository.find(role).await? else {
                continue;
            };

            match self.evaluate(&current) {
                Verdict::Deny => return Err(Self::denied(&current)),
                Verdict::Take { reclaim } => {
                    if self.repository.replace(current.lease_token, &fresh).await? {
                        if reclaim {
                            info!(
                                %role,
                                pid,
                                previous_pid = current.holder_pid,
                                "Stale role lease reclaimed"
                            );
                        } else {
                            info!(%role, pid, "Released role claimed");
                        }
                        return Ok(ClaimGrant {
                            lease: fresh.lease(),
                            reclaimed_from: reclaim.then_some(current),
                        });
                    }
                    debug!(%role, pid, "Lost role takeover race, re-evaluating");
                }
            }
            last_seen = Some(current);
        }

        match self.repository.find(role).await? {
            Some(current) => Err(Self::denied(&current)),
            None => Err(match last_seen {
                Some(previous) => Self::denied(&previous),
                None => Error::Conflict(format!("role {} changed repeatedly during claim", role)),
            }),
        }
    }

    fn evaluate(&self, current: &RoleRegistration) -> Verdict {
        if current.is_released() {
            return Verdict::Take { reclaim: false };
        }

        let now = self.clock.now();
        if !current.is_stale(now, self.staleness_timeout) {
            return Verdict::Deny;
        }

        if !self.probe.is_alive(current.holder_pid) {
            return Verdict::Take { reclaim: true };
        }

        let silent_for = now - current.last_seen();
        if silent_for > self.staleness_timeout + self.reclaim_grace {
            warn!(
                role = %current.role,
                holder_pid = current.holder_pid,
                silent_seconds = silent_for.num_seconds(),
                "Holder is alive but silent past the reclaim grace period, taking over"
            );
            Verdict::Take { reclaim: true }
        } else {
            warn!(
                role = %current.role,
                holder_pid = current.holder_pid,
                silent_seconds = silent_for.num_seconds(),
                "Holder is stale but its process is still alive"
            );
            Verdict::Deny
        }
    }

    fn denied(current: &RoleRegistration) -> Error {
        conductor_core::Error::ClaimDenied {
            role: current.role,
            holder_pid: current.holder_pid,
            claimed_at: current.claimed_at,
        }
        .into()
    }

    fn lease_lost(role: Role) -> Error {
        conductor_core::Error::LeaseLost { role }.into()
    }

    pub async fn heartbeat(&self, lease: &Lease) -> Result<()> {
        if self
            .repository
            .heartbeat(lease.role, lease.token, self.clock.now())
            .await?
        {
            Ok(())
        } else {
            warn!(role = %lease.role, "Heartbeat rejected, lease no longer held");
            Err(Self::lease_lost(lease.role))
        }
    }

    /// Release a lease; releasing twice is a no-op
    pub async fn release(&self, lease: &Lease) -> Result<()> {
        if self
            .repository
            .release(lease.role, lease.token, self.clock.now())
            .await?
        {
            info!(role = %lease.role, "Role released");
            return Ok(());
        }
        match self.repository.find(lease.role).await? {
            Some(current) if current.lease_token == lease.token && current.is_released() => Ok(()),
            _ => Err(Self::lease_lost(lease.role)),
        }
    }

    /// Hand the lease to the process actually doing the work
    pub async fn assign_holder(&self, lease: &Lease, pid: u32) -> Result<Lease> {
        if self
            .repository
            .set_holder(lease.role, lease.token, pid)
            .await?
        {
            debug!(role = %lease.role, pid, "Lease holder reassigned");
            Ok(Lease {
                holder_pid: pid,
                ..lease.clone()
            })
        } else {
            Err(Self::lease_lost(lease.role))
        }
    }

    pub async fn is_stale(&self, role: Role) -> Result<bool> {
        Ok(match self.repository.find(role).await? {
            Some(current) => {
                !current.is_released() && current.is_stale(self.clock.now(), self.staleness_timeout)
            }
            None => false,
        })
    }

    pub async fn state(&self, role: Role) -> Result<RegistrationState> {
        Ok(match self.repository.find(role).await? {
            Some(current) => current.state(self.clock.now(), self.staleness_timeout),
            None => RegistrationState::Unclaimed,
        })
    }

    /// The lease recorded for `role` unless it was released
    pub async fn current_lease(&self, role: Role) -> Result<Option<Lease>> {
        Ok(self
            .repository
            .find(role)
            .await?
            .filter(|current| !current.is_released())
            .map(|current| current.lease()))
    }

    /// A fresh registration whose process still exists
    pub async fn has_live_holder(&self, role: Role) -> Result<bool> {
        Ok(match self.repository.find(role).await? {
            Some(current) => {
                current.state(self.clock.now(), self.staleness_timeout)
                    == RegistrationState::Claimed
                    && self.probe.is_alive(current.holder_pid)
            }
            None => false,
        })
    }

    /// Operator override: drop the registration whoever holds it
    pub async fn force_release(&self, role: Role) -> Result<bool> {
        let removed = self.repository.delete(role).await?;
        if removed {
            warn!(%role, "Role registration force-released");
        }
        Ok(removed)
    }

    pub async fn list(&self) -> Result<Vec<RoleStatus>> {
        let now = self.clock.now();
        Ok(self
            .repository
            .list()
            .await?
            .into_iter()
            .map(|registration| RoleStatus {
                state: registration.state(now, self.staleness_timeout),
                holder_alive: self.probe.is_alive(registration.holder_pid),
                registration,
            })
            .collect())
    }
}
