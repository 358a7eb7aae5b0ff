//! Sync engine: the inbound API over the per-entity workers.
//!
//! The engine owns the worker registry and the shared collaborators. It
//! holds no entity state itself; every call is forwarded to the entity's
//! worker over its command channel.

use crate::config::SyncConfig;
use crate::conflict::{ConflictStrategy, ManualChoice};
use crate::error::{SyncError, SyncResult};
use crate::events::SyncEvent;
use crate::feed::ChangeFeed;
use crate::network::NetworkMonitor;
use crate::persistence::PersistenceApi;
use crate::status::{self, StatusUpdate};
use crate::worker::{self, EntityInfo, WorkerCommand, WorkerContext, WorkerHandle};
use casesync_types::{EntityId, FieldValue, SaveStatus, Snapshot};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// The synchronization engine.
///
/// Must be created inside a tokio runtime: construction spawns the status
/// aggregator, and every [`SyncEngine::open`] spawns an entity worker.
pub struct SyncEngine {
    config: Arc<SyncConfig>,
    api: Arc<dyn PersistenceApi>,
    feed: Option<Arc<dyn ChangeFeed>>,
    strategy: ConflictStrategy,
    network: NetworkMonitor,
    events: broadcast::Sender<SyncEvent>,
    status_tx: mpsc::UnboundedSender<StatusUpdate>,
    global: watch::Receiver<SaveStatus>,
    workers: RwLock<HashMap<EntityId, WorkerHandle>>,
}

impl SyncEngine {
    /// Creates an engine writing through `api` and following `network`.
    /// Conflicts default to the manual strategy; there is no change feed
    /// until [`SyncEngine::with_feed`] is called.
    pub fn new(config: SyncConfig, api: Arc<dyn PersistenceApi>, network: NetworkMonitor) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let initial = if network.is_online() {
            SaveStatus::Idle
        } else {
            SaveStatus::Offline
        };
        let (global_tx, global) = watch::channel(initial);
        tokio::spawn(status::run_board(
            status_rx,
            network.subscribe(),
            events.clone(),
            global_tx,
        ));

        Self {
            config: Arc::new(config),
            api,
            feed: None,
            strategy: ConflictStrategy::default(),
            network,
            events,
            status_tx,
            global,
            workers: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribes every entity opened from now on to `feed`.
    pub fn with_feed(mut self, feed: Arc<dyn ChangeFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    /// Sets the conflict strategy for entities opened from now on.
    pub fn with_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the conflict strategy.
    pub fn strategy(&self) -> &ConflictStrategy {
        &self.strategy
    }

    /// Returns the network monitor.
    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    /// Subscribes to presentation events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// The screen-wide aggregate status.
    pub fn global_status(&self) -> SaveStatus {
        *self.global.borrow()
    }

    /// Watches the aggregate status.
    pub fn watch_global_status(&self) -> watch::Receiver<SaveStatus> {
        self.global.clone()
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Starts tracking an entity from its last known server state.
    pub async fn open(&self, baseline: Snapshot) -> SyncResult<()> {
        let entity_id = baseline.entity_id;
        if self.workers.read().await.contains_key(&entity_id) {
            return Err(SyncError::AlreadyOpen(entity_id));
        }

        let feed = match &self.feed {
            Some(feed) => Some(feed.subscribe(entity_id).await?),
            None => None,
        };

        let mut workers = self.workers.write().await;
        if workers.contains_key(&entity_id) {
            return Err(SyncError::AlreadyOpen(entity_id));
        }
        let handle = worker::spawn(self.context(), baseline, feed);
        workers.insert(entity_id, handle);
        info!("Opened entity {}", entity_id);
        Ok(())
    }

    /// Flushes pending edits, waits for the queue to settle and stops the
    /// entity's worker. Edits that cannot be sent (offline, failed, or held
    /// by a conflict) are reported with [`SyncEvent::LocalEditsDropped`].
    pub async fn close(&self, entity_id: EntityId) -> SyncResult<()> {
        let handle = self
            .workers
            .write()
            .await
            .remove(&entity_id)
            .ok_or(SyncError::EntityNotOpen(entity_id))?;
        if handle.tx.send(WorkerCommand::Close).await.is_err() {
            warn!("Worker for entity {} was already gone", entity_id);
        }
        drop(handle.tx);
        if let Err(e) = handle.task.await {
            warn!("Worker for entity {} ended abnormally: {}", entity_id, e);
        }
        info!("Closed entity {}", entity_id);
        Ok(())
    }

    /// Stops every worker without flushing. Returns how many unsent patches
    /// (including pending debounce edits) were abandoned.
    pub async fn shutdown(&self) -> usize {
        let handles: Vec<(EntityId, WorkerHandle)> =
            self.workers.write().await.drain().collect();
        let mut dropped = 0;
        for (entity_id, handle) in handles {
            let (reply, rx) = oneshot::channel();
            if handle.tx.send(WorkerCommand::Stop { reply }).await.is_ok() {
                dropped += rx.await.unwrap_or(0);
            }
            if let Err(e) = handle.task.await {
                warn!("Worker for entity {} ended abnormally: {}", entity_id, e);
            }
        }
        info!("Sync engine shut down ({} unsent patches)", dropped);
        dropped
    }

    /// Ids of every open entity.
    pub async fn open_entities(&self) -> Vec<EntityId> {
        self.workers.read().await.keys().copied().collect()
    }

    /// Whether an entity is open.
    pub async fn is_open(&self, entity_id: &EntityId) -> bool {
        self.workers.read().await.contains_key(entity_id)
    }

    // ── Edits ────────────────────────────────────────────────────

    /// Records a local edit. It is coalesced with other edits to the same
    /// entity and written once the entity has been quiet for the debounce
    /// period.
    pub async fn submit_field_edit(
        &self,
        entity_id: EntityId,
        field: impl Into<String>,
        value: impl Into<FieldValue>,
    ) -> SyncResult<()> {
        let command = WorkerCommand::Edit {
            field: field.into(),
            value: value.into(),
        };
        self.send(entity_id, command).await
    }

    /// Writes an entity's pending edits without waiting for the debounce.
    pub async fn flush_now(&self, entity_id: EntityId) -> SyncResult<()> {
        self.send(entity_id, WorkerCommand::FlushNow).await
    }

    /// Flushes every open entity.
    pub async fn flush_all(&self) -> SyncResult<()> {
        for entity_id in self.open_entities().await {
            match self.flush_now(entity_id).await {
                // Closed in the meantime.
                Err(SyncError::EntityNotOpen(_)) => {}
                other => other?,
            }
        }
        Ok(())
    }

    /// Drops pending and queued edits and any open conflict. A write
    /// already in flight still completes.
    pub async fn discard_local_edits(&self, entity_id: EntityId) -> SyncResult<()> {
        self.send(entity_id, WorkerCommand::Discard).await
    }

    /// Resumes draining after a terminal failure.
    pub async fn retry(&self, entity_id: EntityId) -> SyncResult<()> {
        self.send(entity_id, WorkerCommand::Retry).await
    }

    // ── Remote changes ───────────────────────────────────────────

    /// Settles a conflict held for a manual decision.
    pub async fn resolve_conflict(&self, entity_id: EntityId, choice: ManualChoice) -> SyncResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(entity_id, WorkerCommand::Resolve { choice, reply })
            .await?;
        rx.await.map_err(|_| SyncError::ChannelClosed)?
    }

    /// Feeds a snapshot obtained outside the change feed (a refetch, say)
    /// through the same detection path as pushed snapshots.
    pub async fn apply_remote_snapshot(&self, snapshot: Snapshot) -> SyncResult<()> {
        let entity_id = snapshot.entity_id;
        self.send(entity_id, WorkerCommand::RemoteSnapshot(snapshot))
            .await
    }

    /// Current state of an entity.
    pub async fn entity_info(&self, entity_id: EntityId) -> SyncResult<EntityInfo> {
        let (reply, rx) = oneshot::channel();
        self.send(entity_id, WorkerCommand::Inspect { reply }).await?;
        rx.await.map_err(|_| SyncError::ChannelClosed)
    }

    /// Visible save status of an entity.
    pub async fn status(&self, entity_id: EntityId) -> SyncResult<SaveStatus> {
        Ok(self.entity_info(entity_id).await?.status)
    }

    fn context(&self) -> WorkerContext {
        WorkerContext {
            config: Arc::clone(&self.config),
            api: Arc::clone(&self.api),
            strategy: self.strategy.clone(),
            events: self.events.clone(),
            status_tx: self.status_tx.clone(),
            network: self.network.clone(),
        }
    }

    async fn send(&self, entity_id: EntityId, command: WorkerCommand) -> SyncResult<()> {
        let tx = self
            .workers
            .read()
            .await
            .get(&entity_id)
            .map(|handle| handle.tx.clone())
            .ok_or(SyncError::EntityNotOpen(entity_id))?;
        tx.send(command).await.map_err(|_| {
            debug!("Worker for entity {} is gone", entity_id);
            SyncError::ChannelClosed
        })
    }
}
