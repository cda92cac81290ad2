//! Coordination settings
//!
//! Timeouts, retry policy and batch limits. These are deserialized from the
//! `coordination` and `mailbox` sections of the application configuration;
//! every field has a default.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::work_item::Role;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationSettings {
    pub staleness_timeout_seconds: u64,
    /// Extra wait before a stale lease held by a live process is taken over
    pub reclaim_grace_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    pub poll_interval_ms: u64,
    pub max_batch_size: usize,
    pub kill_grace_seconds: u64,
    pub default_role_timeout_seconds: u64,
    /// Per-role overrides keyed by role name
    pub role_timeouts: BTreeMap<String, u64>,
    pub retry: RetryPolicy,
}

impl Default for CoordinationSettings {
    fn default() -> Self {
        Self {
            staleness_timeout_seconds: 30,
            reclaim_grace_seconds: 120,
            heartbeat_interval_seconds: 10,
            poll_interval_ms: 1000,
            max_batch_size: 4,
            kill_grace_seconds: 10,
            default_role_timeout_seconds: 1800,
            role_timeouts: BTreeMap::new(),
            retry: RetryPolicy::default(),
        }
    }
}

impl CoordinationSettings {
    pub fn staleness_timeout(&self) -> Duration {
        Duration::seconds(self.staleness_timeout_seconds as i64)
    }

    pub fn reclaim_grace(&self) -> Duration {
        Duration::seconds(self.reclaim_grace_seconds as i64)
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }

    pub fn kill_grace(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.kill_grace_seconds)
    }

    pub fn timeout_seconds_for(&self, role: Role) -> u64 {
        self.role_timeouts
            .get(role.as_str())
            .copied()
            .unwrap_or(self.default_role_timeout_seconds)
    }

    pub fn timeout_for(&self, role: Role) -> Duration {
        Duration::seconds(self.timeout_seconds_for(role) as i64)
    }

    pub fn validate(&self) -> Result<()> {
        if self.staleness_timeout_seconds == 0 {
            return Err(Error::configuration(
                "coordination.staleness_timeout_seconds must be greater than 0",
            ));
        }
        if self.heartbeat_interval_seconds >= self.staleness_timeout_seconds {
            return Err(Error::configuration(
                "coordination.heartbeat_interval_seconds must be below the staleness timeout",
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::configuration(
                "coordination.poll_interval_ms must be greater than 0",
            ));
        }
        if self.max_batch_size == 0 {
            return Err(Error::configuration(
                "coordination.max_batch_size must be at least 1",
            ));
        }
        for key in self.role_timeouts.keys() {
            key.parse::<Role>().map_err(|_| {
                Error::configuration(format!("coordination.role_timeouts: unknown role '{}'", key))
            })?;
        }
        self.retry.validate()
    }
}

/// Bounded exponential backoff for failed work items
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total launches allowed per work item, the first one included
    pub max_attempts: u32,
    pub initial_delay_seconds: u64,
    pub backoff_multiplier: f64,
    pub max_delay_seconds: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_seconds: 5,
            backoff_multiplier: 2.0,
            max_delay_seconds: 300,
        }
    }
}

impl RetryPolicy {
    /// Delay before the launch following failed attempt number `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let raw = self.initial_delay_seconds as f64 * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_delay_seconds as f64).max(0.0);
        Duration::milliseconds((capped * 1000.0) as i64)
    }

    pub fn has_attempts_left(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::configuration(
                "coordination.retry.max_attempts must be at least 1",
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(Error::configuration(
                "coordination.retry.backoff_multiplier must be at least 1.0",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxSettings {
    /// Delivered but unacknowledged messages older than this are re-surfaced
    pub redelivery_window_seconds: u64,
    /// Processed messages older than this are archived
    pub retention_seconds: u64,
}

impl Default for MailboxSettings {
    fn default() -> Self {
        Self {
            redelivery_window_seconds: 300,
            retention_seconds: 7 * 24 * 3600,
        }
    }
}

impl MailboxSettings {
    pub fn redelivery_window(&self) -> Duration {
        Duration::seconds(self.redelivery_window_seconds as i64)
    }

    pub fn retention(&self) -> Duration {
        Duration::seconds(self.retention_seconds as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(CoordinationSettings::default().validate().is_ok());
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay_seconds: 5,
            backoff_multiplier: 2.0,
            max_delay_seconds: 30,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::seconds(5));
        assert_eq!(policy.delay_for_attempt(2), Duration::seconds(10));
        assert_eq!(policy.delay_for_attempt(3), Duration::seconds(20));
        assert_eq!(policy.delay_for_attempt(4), Duration::seconds(30));
        assert_eq!(policy.delay_for_attempt(40), Duration::seconds(30));
        assert!(policy.has_attempts_left(4));
        assert!(!policy.has_attempts_left(5));
    }

    #[test]
    fn test_role_timeouts() {
        let mut settings = CoordinationSettings::default();
        settings.role_timeouts.insert("tester".into(), 60);
        assert_eq!(settings.timeout_seconds_for(Role::Tester), 60);
        assert_eq!(settings.timeout_seconds_for(Role::Coder), 1800);

        settings.role_timeouts.insert("wizard".into(), 5);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_invalid_settings() {
        let settings = CoordinationSettings {
            heartbeat_interval_seconds: 30,
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        let settings = CoordinationSettings {
            retry: RetryPolicy {
                max_attempts: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
