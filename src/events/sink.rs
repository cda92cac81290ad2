//! Event sinks

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{CoordinatorEvent, EventKind};
use crate::Result;
use conductor_storage::repositories::EventRepository;

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: &CoordinatorEvent) -> Result<()>;
}

/// Persists events to the store and mirrors them to the log
pub struct StoreEventSink {
    repository: Arc<EventRepository>,
}

impl StoreEventSink {
    pub fn new(repository: Arc<EventRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl EventSink for StoreEventSink {
    async fn emit(&self, event: &CoordinatorEvent) -> Result<()> {
        let work_item_id = event.work_item_id.as_ref().map(|id| id.as_str());
        let role = event.role.map(|r| r.as_str());
        let id = self
            .repository
            .append(
                event.kind.as_str(),
                work_item_id,
                role,
                &event.payload,
                event.timestamp,
            )
            .await?;

        match event.kind {
            EventKind::InstanceFailed
            | EventKind::InstanceHung
            | EventKind::MergeConflict
            | EventKind::WorkItemBlocked => warn!(
                event_id = id,
                kind = %event.kind,
                work_item_id = work_item_id.unwrap_or("-"),
                role = role.unwrap_or("-"),
                payload = %event.payload,
                "Coordinator event"
            ),
            _ => info!(
                event_id = id,
                kind = %event.kind,
                work_item_id = work_item_id.unwrap_or("-"),
                role = role.unwrap_or("-"),
                payload = %event.payload,
                "Coordinator event"
            ),
        }
        Ok(())
    }
}

/// In-process fan-out to subscribers
pub struct BroadcastEventSink {
    sender: broadcast::Sender<CoordinatorEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EventSink for BroadcastEventSink {
    async fn emit(&self, event: &CoordinatorEvent) -> Result<()> {
        // No subscribers is not an error
        if self.sender.send(event.clone()).is_err() {
            debug!(kind = %event.kind, "No event subscribers");
        }
        Ok(())
    }
}

/// Delivers each event to every inner sink; a failing sink does not stop the others
#[derive(Default)]
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl EventSink for FanoutEventSink {
    async fn emit(&self, event: &CoordinatorEvent) -> Result<()> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.emit(event).await {
                warn!(kind = %event.kind, "Event sink failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
