//! Application wiring: one store, one registry, one mailbox and the
//! coordinator built on top of them

use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::coordinator::{Collaborators, ParallelExecutionCoordinator};
use crate::events::{BroadcastEventSink, EventSink, FanoutEventSink, StoreEventSink};
use crate::workers::{ProcessLauncher, SysinfoProcessProbe};
use crate::workspace::GitWorkspaceManager;
use crate::Result;
use conductor_core::clock::{Clock, ProcessProbe, SystemClock};
use conductor_core::footprint::SpecDocumentFootprint;
use conductor_storage::{MailboxRouter, SingletonRegistry, StorageManager};

/// Capacity of the in-process event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct App {
    pub config: Config,
    pub storage: Arc<StorageManager>,
    pub registry: Arc<SingletonRegistry>,
    pub mailbox: Arc<MailboxRouter>,
    pub events: Arc<BroadcastEventSink>,
    pub coordinator: Arc<ParallelExecutionCoordinator>,
}

impl App {
    /// Connect to the store and build every component from `config`
    pub async fn build(config: Config) -> Result<Self> {
        let storage = Arc::new(StorageManager::new(&config.database_config()).await?);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let probe: Arc<dyn ProcessProbe> = Arc::new(SysinfoProcessProbe::new());

        let registry = Arc::new(SingletonRegistry::new(
            storage.registrations(),
            clock.clone(),
            probe.clone(),
            config.coordination.staleness_timeout(),
            config.coordination.reclaim_grace(),
        ));
        let mailbox = Arc::new(MailboxRouter::new(
            storage.messages(),
            registry.clone(),
            config.routing.clone(),
            config.mailbox.clone(),
            clock.clone(),
        ));

        let broadcast = Arc::new(BroadcastEventSink::new(EVENT_CHANNEL_CAPACITY));
        let sink: Arc<dyn EventSink> = Arc::new(
            FanoutEventSink::new()
                .with(Arc::new(StoreEventSink::new(storage.events())))
                .with(broadcast.clone()),
        );

        let resolver = SpecDocumentFootprint::new(Some(config.workspace.repo_path.clone()))?;
        let coordinator = Arc::new(ParallelExecutionCoordinator::new(
            Collaborators {
                storage: storage.clone(),
                registry: registry.clone(),
                mailbox: mailbox.clone(),
                workspaces: Arc::new(GitWorkspaceManager::from_config(&config.workspace)),
                launcher: Arc::new(ProcessLauncher::new(config.worker.clone(), probe)),
                resolver: Arc::new(resolver),
                events: sink,
                clock,
            },
            config.coordination.clone(),
        ));

        info!(
            database = %config.database.url,
            repo = %config.workspace.repo_path.display(),
            max_batch_size = config.coordination.max_batch_size,
            "Conductor initialized"
        );
        Ok(Self {
            config,
            storage,
            registry,
            mailbox,
            events: broadcast,
            coordinator,
        })
    }
}
