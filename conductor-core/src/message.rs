//! Message domain model for inter-role communication
//!
//! Messages are addressed to roles, not processes, so they survive the
//! worker holding a role being replaced. Delivery is at-least-once:
//! a message stays visible to its recipient until it is acknowledged.
//!
//! # Examples
//!
//! ```rust
//! use conductor_core::message::*;
//! use conductor_core::work_item::Role;
//!
//! let message = Message::builder()
//!     .from_role(Role::Integrator)
//!     .to_role(Role::Reviewer)
//!     .payload(r#"{"event":"work_item_integrated","work_item_id":"wi-1"}"#)
//!     .priority(MessagePriority::High)
//!     .build()
//!     .unwrap();
//! assert_eq!(message.status, MessageStatus::Pending);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::work_item::{Role, WorkItemId};
use crate::{Error, Result};

/// Maximum payload size accepted by the mailbox
pub const MAX_PAYLOAD_LENGTH: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub from_role: Role,
    pub to_role: Role,
    pub payload: String,
    pub priority: MessagePriority,
    pub status: MessageStatus,
    pub intent: Option<String>,
    pub work_item_id: Option<WorkItemId>,
    pub routed_via_fallback: bool,
    pub delivery_count: u32,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Low,
    Normal,
    High,
    Critical,
}

impl MessagePriority {
    /// Numeric rank used for ordering, higher drains first
    pub fn rank(&self) -> i64 {
        match self {
            MessagePriority::Low => 0,
            MessagePriority::Normal => 1,
            MessagePriority::High => 2,
            MessagePriority::Critical => 3,
        }
    }

    pub fn from_rank(rank: i64) -> Result<Self> {
        match rank {
            0 => Ok(MessagePriority::Low),
            1 => Ok(MessagePriority::Normal),
            2 => Ok(MessagePriority::High),
            3 => Ok(MessagePriority::Critical),
            other => Err(Error::validation(format!(
                "Unknown message priority rank {}",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessagePriority::Low => "low",
            MessagePriority::Normal => "normal",
            MessagePriority::High => "high",
            MessagePriority::Critical => "critical",
        }
    }
}

impl PartialOrd for MessagePriority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MessagePriority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl fmt::Display for MessagePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessagePriority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(MessagePriority::Low),
            "normal" => Ok(MessagePriority::Normal),
            "high" => Ok(MessagePriority::High),
            "critical" => Ok(MessagePriority::Critical),
            other => Err(Error::validation(format!(
                "Unknown message priority '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Delivered,
    Processed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Processed => "processed",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "delivered" => Ok(MessageStatus::Delivered),
            "processed" => Ok(MessageStatus::Processed),
            other => Err(Error::validation(format!(
                "Unknown message status '{}'",
                other
            ))),
        }
    }
}

impl Message {
    pub fn builder() -> MessageBuilder {
        MessageBuilder::new()
    }

    pub fn is_acknowledged(&self) -> bool {
        self.status == MessageStatus::Processed
    }

    fn validate_payload(payload: &str) -> Result<()> {
        if payload.trim().is_empty() {
            return Err(Error::validation("Message payload cannot be empty"));
        }
        if payload.len() > MAX_PAYLOAD_LENGTH {
            return Err(Error::validation(format!(
                "Message payload cannot exceed {} bytes",
                MAX_PAYLOAD_LENGTH
            )));
        }
        Ok(())
    }
}

/// Builder for creating Message instances
#[derive(Debug, Default)]
pub struct MessageBuilder {
    from_role: Option<Role>,
    to_role: Option<Role>,
    payload: Option<String>,
    priority: Option<MessagePriority>,
    intent: Option<String>,
    work_item_id: Option<WorkItemId>,
    routed_via_fallback: bool,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_role(mut self, role: Role) -> Self {
        self.from_role = Some(role);
        self
    }

    pub fn to_role(mut self, role: Role) -> Self {
        self.to_role = Some(role);
        self
    }

    pub fn payload<S: Into<String>>(mut self, payload: S) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn priority(mut self, priority: MessagePriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn intent<S: Into<String>>(mut self, intent: S) -> Self {
        self.intent = Some(intent.into());
        self
    }

    pub fn work_item_id(mut self, id: WorkItemId) -> Self {
        self.work_item_id = Some(id);
        self
    }

    pub fn routed_via_fallback(mut self, via_fallback: bool) -> Self {
        self.routed_via_fallback = via_fallback;
        self
    }

    pub fn build(self) -> Result<Message> {
        let from_role = self
            .from_role
            .ok_or_else(|| Error::validation("Sender role is required"))?;
        let to_role = self
            .to_role
            .ok_or_else(|| Error::validation("Recipient role is required"))?;
        let payload = self
            .payload
            .ok_or_else(|| Error::validation("Message payload is required"))?;
        Message::validate_payload(&payload)?;

        Ok(Message {
            id: Uuid::new_v4(),
            from_role,
            to_role,
            payload,
            priority: self.priority.unwrap_or(MessagePriority::Normal),
            status: MessageStatus::Pending,
            intent: self.intent,
            work_item_id: self.work_item_id,
            routed_via_fallback: self.routed_via_fallback,
            delivery_count: 0,
            created_at: Utc::now(),
            delivered_at: None,
            processed_at: None,
        })
    }
}
