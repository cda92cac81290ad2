//! Role-addressed mailbox with capability routing
//!
//! `send` persists a Pending message before returning. `poll` is a
//! non-destructive read of everything unacknowledged, moving Pending
//! messages to Delivered as they are first observed. `ack` marks a message
//! Processed and may be repeated. A sweep puts deliveries that stayed
//! unacknowledged past the redelivery window back to Pending.

use chrono::Duration;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::SingletonRegistry;
use crate::repositories::MessageRepository;
use crate::{Error, Result};
use conductor_core::clock::Clock;
use conductor_core::config::MailboxSettings;
use conductor_core::message::{Message, MessagePriority, MessageStatus};
use conductor_core::routing::{CapabilityTable, RouteDecision};
use conductor_core::work_item::{Role, WorkItemId};

#[derive(Debug, Clone, Serialize)]
pub struct RoutedMessage {
    pub message_id: Uuid,
    pub to_role: Role,
    pub routed_via_fallback: bool,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub message_id: Uuid,
    pub to_role: Role,
    /// 1 + earlier unacknowledged messages of the same or higher priority
    pub position: i64,
    /// `position * average processing time`, unknown without history
    pub eta_seconds: Option<f64>,
}

impl QueueStatus {
    pub fn eta(&self) -> Option<Duration> {
        self.eta_seconds
            .map(|secs| Duration::milliseconds((secs * 1000.0) as i64))
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub redelivered: u64,
    pub archived: u64,
}

pub struct MailboxRouter {
    repository: Arc<MessageRepository>,
    registry: Arc<SingletonRegistry>,
    table: CapabilityTable,
    settings: MailboxSettings,
    clock: Arc<dyn Clock>,
}

impl MailboxRouter {
    pub fn new(
        repository: Arc<MessageRepository>,
        registry: Arc<SingletonRegistry>,
        table: CapabilityTable,
        settings: MailboxSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repository,
            registry,
            table,
            settings,
            clock,
        }
    }

    pub async fn send(
        &self,
        from_role: Role,
        to_role: Role,
        payload: &str,
        priority: MessagePriority,
    ) -> Result<Uuid> {
        let message = Message::builder()
            .from_role(from_role)
            .to_role(to_role)
            .payload(payload)
            .priority(priority)
            .build()?;
        self.store(message).await
    }

    async fn store(&self, mut message: Message) -> Result<Uuid> {
        message.created_at = self.clock.now();
        self.repository.create(&message).await?;
        debug!(
            message_id = %message.id,
            from = %message.from_role,
            to = %message.to_role,
            priority = %message.priority,
            "Message queued"
        );
        Ok(message.id)
    }

    /// Unacknowledged messages for `role`, highest priority first, oldest first
    pub async fn poll(&self, role: Role) -> Result<Vec<Message>> {
        let now = self.clock.now();
        let mut messages = self.repository.list_unprocessed(role).await?;
        for message in messages.iter_mut() {
            if message.status == MessageStatus::Pending
                && self.repository.mark_delivered(message.id, now).await?
            {
                message.status = MessageStatus::Delivered;
                message.delivered_at = Some(now);
                message.delivery_count += 1;
            }
        }
        Ok(messages)
    }

    /// Mark a message processed; acknowledging twice is harmless
    pub async fn ack(&self, message_id: Uuid) -> Result<Message> {
        let message = self
            .repository
            .mark_processed(message_id, self.clock.now())
            .await?;
        debug!(%message_id, to = %message.to_role, "Message acknowledged");
        Ok(message)
    }

    pub fn route(&self, intent: &str) -> Result<RouteDecision> {
        Ok(self.table.resolve(intent)?)
    }

    /// Primary when it has a live holder, otherwise the fallback if one exists
    async fn recipient_for(&self, decision: &RouteDecision) -> Result<(Role, bool)> {
        if self.registry.has_live_holder(decision.primary).await? {
            return Ok((decision.primary, false));
        }
        match decision.fallback {
            Some(fallback) => {
                info!(
                    intent = %decision.intent,
                    primary = %decision.primary,
                    %fallback,
                    "Primary role has no live holder, routing to fallback"
                );
                Ok((fallback, true))
            }
            None => Ok((decision.primary, false)),
        }
    }

    pub async fn send_routed(
        &self,
        from_role: Role,
        intent: &str,
        payload: &str,
        priority: MessagePriority,
        work_item_id: Option<&WorkItemId>,
    ) -> Result<RoutedMessage> {
        let decision = self.route(intent)?;
        let (to_role, via_fallback) = self.recipient_for(&decision).await?;

        let mut builder = Message::builder()
            .from_role(from_role)
            .to_role(to_role)
            .payload(payload)
            .priority(priority)
            .intent(decision.intent.clone())
            .routed_via_fallback(via_fallback);
        if let Some(id) = work_item_id {
            builder = builder.work_item_id(id.clone());
        }
        let message_id = self.store(builder.build()?).await?;

        Ok(RoutedMessage {
            message_id,
            to_role,
            routed_via_fallback: via_fallback,
            confidence: decision.confidence,
        })
    }

    pub async fn queue_status(&self, message_id: Uuid) -> Result<Option<QueueStatus>> {
        let message = self
            .repository
            .find_by_id(message_id)
            .await?
            .ok_or_else(|| Error::not_found("Message", message_id.to_string()))?;
        if message.is_acknowledged() {
            return Ok(None);
        }

        let position = self.repository.count_ahead_of(&message).await? + 1;
        let eta_seconds = self
            .repository
            .average_processing_seconds(message.to_role)
            .await?
            .map(|avg| position as f64 * avg);

        Ok(Some(QueueStatus {
            message_id,
            to_role: message.to_role,
            position,
            eta_seconds,
        }))
    }

    pub async fn queue_position(&self, message_id: Uuid) -> Result<Option<i64>> {
        Ok(self.queue_status(message_id).await?.map(|s| s.position))
    }

    pub async fn inbox(&self, role: Role, limit: i64) -> Result<Vec<Message>> {
        self.repository.list_for_role(role, limit).await
    }

    /// Re-surface overdue deliveries and archive old processed messages
    pub async fn sweep(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let report = SweepReport {
            redelivered: self
                .repository
                .redeliver_overdue(now - self.settings.redelivery_window())
                .await?,
            archived: self
                .repository
                .archive_processed_before(now - self.settings.retention())
                .await?,
        };
        if report.redelivered > 0 || report.archived > 0 {
            info!(
                redelivered = report.redelivered,
                archived = report.archived,
                "Mailbox sweep"
            );
        }
        Ok(report)
    }
}
