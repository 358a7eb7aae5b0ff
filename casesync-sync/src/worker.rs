//! Per-entity worker.
//!
//! One task per open entity owns everything about that entity: the
//! debouncer, the mutation queue, the save status, the local baseline and
//! the conflict state. Inbound calls, write completions, feed pushes,
//! connectivity changes and timers all arrive at a single `select!` loop, so
//! the entity's state is only ever touched by one logical thread.

use crate::config::SyncConfig;
use crate::conflict::{
    self, ConflictMonitor, ConflictState, ConflictStrategy, ManualChoice, Resolution,
    SnapshotVerdict,
};
use crate::debounce::DebounceAggregator;
use crate::error::{SyncError, SyncResult, WriteError};
use crate::events::SyncEvent;
use crate::network::{self, Connectivity, NetworkMonitor};
use crate::persistence::{PersistenceApi, WriteAck};
use crate::queue::{FailureOutcome, MutationQueue};
use crate::status::{SaveStatusTracker, StatusUpdate};
use casesync_types::{
    ConflictRecord, EntityId, FieldPatch, FieldValue, Fields, SaveStatus, Seq, Snapshot, Version,
    apply_fields,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Point-in-time view of one entity, for inspection and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityInfo {
    /// The entity.
    pub entity_id: EntityId,
    /// Visible save status.
    pub status: SaveStatus,
    /// Last accepted server state with acknowledged writes applied.
    pub baseline: Snapshot,
    /// Newest server version produced or seen by this client.
    pub known_version: Version,
    /// Edits still in the debouncer.
    pub pending_fields: Fields,
    /// Patch awaiting a response.
    pub in_flight: Option<FieldPatch>,
    /// Patches waiting to be sent, head first.
    pub queued: Vec<FieldPatch>,
    /// Whether draining is paused after a failure.
    pub paused: bool,
    /// Conflict-handling state.
    pub conflict_state: ConflictState,
    /// The open conflict, if any.
    pub conflict: Option<ConflictRecord>,
}

impl EntityInfo {
    /// The entity as the local user sees it: baseline plus every
    /// unacknowledged edit.
    pub fn local_view(&self) -> Fields {
        let mut view = self.baseline.fields.clone();
        if let Some(patch) = &self.in_flight {
            apply_fields(&mut view, &patch.fields);
        }
        for patch in &self.queued {
            apply_fields(&mut view, &patch.fields);
        }
        apply_fields(&mut view, &self.pending_fields);
        view
    }

    /// Whether any local edit is not yet acknowledged.
    pub fn has_unacknowledged(&self) -> bool {
        self.in_flight.is_some() || !self.queued.is_empty() || !self.pending_fields.is_empty()
    }
}

/// Messages from the engine to a worker.
pub(crate) enum WorkerCommand {
    Edit {
        field: String,
        value: FieldValue,
    },
    FlushNow,
    Discard,
    Retry,
    Resolve {
        choice: ManualChoice,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    RemoteSnapshot(Snapshot),
    Inspect {
        reply: oneshot::Sender<EntityInfo>,
    },
    Close,
    Stop {
        reply: oneshot::Sender<usize>,
    },
}

/// Shared collaborators handed to every worker.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub config: Arc<SyncConfig>,
    pub api: Arc<dyn PersistenceApi>,
    pub strategy: ConflictStrategy,
    pub events: broadcast::Sender<SyncEvent>,
    pub status_tx: mpsc::UnboundedSender<StatusUpdate>,
    pub network: NetworkMonitor,
}

/// Engine-side handle of a running worker.
pub(crate) struct WorkerHandle {
    pub tx: mpsc::Sender<WorkerCommand>,
    pub task: JoinHandle<()>,
}

struct WriteOutcome {
    seq: Seq,
    result: Result<WriteAck, WriteError>,
}

pub(crate) struct EntityWorker {
    entity_id: EntityId,
    ctx: WorkerContext,
    commands: mpsc::Receiver<WorkerCommand>,
    commands_open: bool,
    feed: Option<mpsc::Receiver<Snapshot>>,
    connectivity: watch::Receiver<Connectivity>,
    online: bool,
    completions_tx: mpsc::UnboundedSender<WriteOutcome>,
    completions: mpsc::UnboundedReceiver<WriteOutcome>,
    debounce: DebounceAggregator,
    queue: MutationQueue,
    status: SaveStatusTracker,
    conflicts: ConflictMonitor,
    baseline: Snapshot,
    /// Last server state seen, before any local merge.
    server: Snapshot,
    known_version: Version,
    closing: bool,
}

/// Starts a worker for `baseline.entity_id`.
pub(crate) fn spawn(
    ctx: WorkerContext,
    baseline: Snapshot,
    feed: Option<mpsc::Receiver<Snapshot>>,
) -> WorkerHandle {
    let (tx, commands) = mpsc::channel(ctx.config.command_buffer.max(1));
    let worker = EntityWorker::new(ctx, baseline, commands, feed);
    let task = tokio::spawn(worker.run());
    WorkerHandle { tx, task }
}

impl EntityWorker {
    fn new(
        ctx: WorkerContext,
        baseline: Snapshot,
        commands: mpsc::Receiver<WorkerCommand>,
        feed: Option<mpsc::Receiver<Snapshot>>,
    ) -> Self {
        let entity_id = baseline.entity_id;
        let connectivity = ctx.network.subscribe();
        let online = connectivity.borrow().is_online();
        let (completions_tx, completions) = mpsc::unbounded_channel();
        let debounce = DebounceAggregator::new(
            entity_id,
            ctx.config.debounce(),
            ctx.config.debounce_max_wait(),
        );
        let status = SaveStatusTracker::new(ctx.config.status_grace(), !online);
        Self {
            entity_id,
            commands,
            commands_open: true,
            feed,
            connectivity,
            online,
            completions_tx,
            completions,
            debounce,
            queue: MutationQueue::new(),
            status,
            conflicts: ConflictMonitor::new(),
            known_version: baseline.version,
            server: baseline.clone(),
            baseline,
            closing: false,
            ctx,
        }
    }

    async fn run(mut self) {
        debug!("Worker started for entity {} at {}", self.entity_id, self.baseline.version);
        let _ = self
            .ctx
            .status_tx
            .send(StatusUpdate::Changed(self.entity_id, self.status.current()));

        loop {
            self.drive_writes();
            if self.closing && self.can_exit() {
                break;
            }

            let debounce_at = self.debounce.deadline();
            let retry_at = self.queue.retry_at();
            let revert_at = self.status.revert_at();

            tokio::select! {
                command = self.commands.recv(), if self.commands_open => match command {
                    Some(WorkerCommand::Stop { reply }) => {
                        let dropped = self.stop();
                        let _ = reply.send(dropped);
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.commands_open = false;
                        self.begin_close();
                    }
                },
                Some(outcome) = self.completions.recv() => self.handle_outcome(outcome),
                snapshot = next_snapshot(&mut self.feed) => match snapshot {
                    Some(snapshot) => self.handle_snapshot(snapshot),
                    None => {
                        debug!("Change feed ended for entity {}", self.entity_id);
                        self.feed = None;
                    }
                },
                now = network::next_transition(&mut self.connectivity) => {
                    self.handle_connectivity(now);
                }
                _ = sleep_until(debounce_at) => self.flush_due(),
                _ = sleep_until(retry_at) => self.queue.backoff_elapsed(),
                _ = sleep_until(revert_at) => self.expire_status(),
            }
        }

        self.report_leftovers();
        let _ = self.ctx.status_tx.send(StatusUpdate::Removed(self.entity_id));
        debug!("Worker stopped for entity {}", self.entity_id);
    }

    // ── Commands ─────────────────────────────────────────────────

    fn handle_command(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::Edit { field, value } => {
                if let Some(status) = self.status.on_edit() {
                    self.report_status(status);
                }
                self.debounce.submit(field, value, Instant::now());
            }
            WorkerCommand::FlushNow => self.flush_pending(),
            WorkerCommand::Discard => self.discard(),
            WorkerCommand::Retry => self.retry(),
            WorkerCommand::Resolve { choice, reply } => {
                let _ = reply.send(self.resolve_manually(choice));
            }
            WorkerCommand::RemoteSnapshot(snapshot) => self.handle_snapshot(snapshot),
            WorkerCommand::Inspect { reply } => {
                let _ = reply.send(self.info());
            }
            WorkerCommand::Close => self.begin_close(),
            // Handled in the run loop.
            WorkerCommand::Stop { .. } => {}
        }
    }

    fn flush_due(&mut self) {
        if let Some(patch) = self.debounce.take_due(Instant::now()) {
            self.enqueue(patch);
        }
    }

    fn flush_pending(&mut self) {
        if let Some(patch) = self.debounce.flush_now() {
            self.enqueue(patch);
        }
    }

    fn enqueue(&mut self, patch: FieldPatch) {
        debug!(
            "Queued {} for entity {} ({} fields)",
            patch.seq,
            self.entity_id,
            patch.len()
        );
        if self.queue.enqueue(patch) {
            info!("Draining resumed for entity {} after a new edit", self.entity_id);
        }
        if let Some(status) = self.status.on_queued() {
            self.report_status(status);
        }
    }

    fn retry(&mut self) {
        let resumed = self.queue.resume();
        if self.queue.queued_len() > 0 {
            if resumed {
                info!("Retrying queued writes for entity {}", self.entity_id);
            }
            if let Some(status) = self.status.on_queued() {
                self.report_status(status);
            }
        } else if self.queue.in_flight().is_none() && self.status.underlying() == SaveStatus::Error {
            if let Some(status) = self.status.on_idle() {
                self.report_status(status);
            }
        }
    }

    fn discard(&mut self) {
        let (dropped_ops, dropped_fields) = self.drop_local_edits();
        if !dropped_fields.is_empty() {
            info!(
                "Discarded {} queued writes ({} fields) for entity {}",
                dropped_ops,
                dropped_fields.len(),
                self.entity_id
            );
            self.emit(SyncEvent::LocalEditsDropped {
                entity_id: self.entity_id,
                dropped_ops,
                dropped_fields,
            });
        }

        let parked = if self.conflicts.is_busy() {
            let parked = self.conflicts.finish();
            self.emit(SyncEvent::ConflictCleared {
                entity_id: self.entity_id,
            });
            parked
        } else {
            None
        };

        if self.queue.in_flight().is_none() {
            if let Some(status) = self.status.on_idle() {
                self.report_status(status);
            }
        }
        if let Some(snapshot) = parked {
            self.handle_snapshot(snapshot);
        }
    }

    fn begin_close(&mut self) {
        self.flush_pending();
        self.closing = true;
    }

    /// A closing worker exits once nothing is in flight and nothing left in
    /// the queue can make progress on its own.
    fn can_exit(&self) -> bool {
        self.queue.in_flight().is_none()
            && !self.debounce.has_pending()
            && (self.queue.queued_len() == 0
                || !self.online
                || self.queue.paused().is_some()
                || self.conflicts.is_busy())
    }

    fn stop(&mut self) -> usize {
        let mut dropped = self.queue.discard_queued().len();
        if self.queue.in_flight().is_some() {
            dropped += 1;
        }
        if self.debounce.cancel().is_some() {
            dropped += 1;
        }
        dropped
    }

    fn report_leftovers(&mut self) {
        let (dropped_ops, dropped_fields) = self.drop_local_edits();
        if !dropped_fields.is_empty() {
            warn!(
                "Entity {} closed with {} unsent writes",
                self.entity_id, dropped_ops
            );
            self.emit(SyncEvent::LocalEditsDropped {
                entity_id: self.entity_id,
                dropped_ops,
                dropped_fields,
            });
        }
    }

    /// Drops the debouncer's pending edits and every queued operation.
    /// Returns the number of queued operations and the affected fields.
    fn drop_local_edits(&mut self) -> (usize, Vec<String>) {
        let mut fields = BTreeSet::new();
        if let Some(pending) = self.debounce.cancel() {
            fields.extend(pending.into_keys());
        }
        let ops = self.queue.discard_queued();
        for op in &ops {
            fields.extend(op.patch.fields.keys().cloned());
        }
        (ops.len(), fields.into_iter().collect())
    }

    // ── Writes ───────────────────────────────────────────────────

    fn drive_writes(&mut self) {
        if !self.online || self.conflicts.is_busy() {
            return;
        }
        let (patch, attempt) = match self.queue.start_next() {
            Some(op) => (op.patch.clone(), op.attempts),
            None => return,
        };
        if let Some(status) = self.status.on_attempt(attempt) {
            self.report_status(status);
        }
        debug!(
            "Sending {} for entity {} (attempt {})",
            patch.seq, self.entity_id, attempt
        );

        let api = Arc::clone(&self.ctx.api);
        let tx = self.completions_tx.clone();
        let timeout = self.ctx.config.request_timeout();
        let expected_base = Some(self.known_version);
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, api.write(&patch, expected_base)).await
            {
                Ok(result) => result,
                Err(_) => Err(WriteError::Timeout),
            };
            let _ = tx.send(WriteOutcome {
                seq: patch.seq,
                result,
            });
        });
    }

    fn handle_outcome(&mut self, outcome: WriteOutcome) {
        let WriteOutcome { seq, result } = outcome;
        match result {
            Ok(ack) => {
                if self.queue.complete_success(seq).is_none() {
                    warn!("Ignoring ack for unknown write {} on entity {}", seq, self.entity_id);
                    return;
                }
                debug!("Write {} acknowledged for entity {} at {}", seq, self.entity_id, ack.version);
                self.apply_ack(ack);
                if !self.queue.has_unacknowledged() {
                    if let Some(status) = self.status.on_saved(Instant::now()) {
                        self.report_status(status);
                    }
                }
                self.clear_settled_conflict();
            }
            Err(error) => {
                let policy = self.ctx.config.retry;
                match self
                    .queue
                    .complete_failure(seq, error.clone(), &policy, Instant::now())
                {
                    None => {
                        warn!("Ignoring failure for unknown write {} on entity {}", seq, self.entity_id);
                    }
                    Some(FailureOutcome::Retry {
                        seq,
                        attempt,
                        delay,
                    }) => {
                        warn!(
                            "Write {} for entity {} failed (attempt {}): {}; retrying in {:?}",
                            seq, self.entity_id, attempt, error, delay
                        );
                        self.emit(SyncEvent::RetryScheduled {
                            entity_id: self.entity_id,
                            seq,
                            attempt,
                            delay,
                        });
                    }
                    Some(FailureOutcome::Exhausted { seq, attempts }) => {
                        warn!(
                            "Write {} for entity {} failed after {} attempts: {}",
                            seq, self.entity_id, attempts, error
                        );
                        self.emit(SyncEvent::WriteFailed {
                            entity_id: self.entity_id,
                            seq,
                            attempts,
                            error,
                        });
                        if let Some(status) = self.status.on_error() {
                            self.report_status(status);
                        }
                    }
                    Some(FailureOutcome::Rejected { op }) => {
                        warn!(
                            "Write {} for entity {} rejected: {}",
                            op.patch.seq, self.entity_id, error
                        );
                        self.emit(SyncEvent::WriteRejected {
                            entity_id: self.entity_id,
                            seq: op.patch.seq,
                            error,
                        });
                        if let Some(status) = self.status.on_error() {
                            self.report_status(status);
                        }
                        self.clear_settled_conflict();
                    }
                }
            }
        }
    }

    /// Applies an acknowledged write on top of the baseline, unless the
    /// baseline already moved past it (a newer remote snapshot was adopted).
    fn apply_ack(&mut self, ack: WriteAck) {
        self.known_version = self.known_version.max(ack.version);
        if ack.version.is_newer_than(&self.server.version) {
            apply_fields(&mut self.server.fields, &ack.applied);
            self.server.version = ack.version;
        }
        if ack.version.is_newer_than(&self.baseline.version) {
            apply_fields(&mut self.baseline.fields, &ack.applied);
            self.baseline.version = ack.version;
            self.emit(SyncEvent::BaselineUpdated {
                entity_id: self.entity_id,
                version: ack.version,
            });
        }
    }

    // ── Remote snapshots & conflicts ─────────────────────────────

    fn handle_snapshot(&mut self, snapshot: Snapshot) {
        if snapshot.entity_id != self.entity_id {
            warn!(
                "Worker for {} ignoring snapshot of {}",
                self.entity_id, snapshot.entity_id
            );
            return;
        }
        if self.conflicts.is_busy() {
            debug!(
                "Parking snapshot {} for entity {} until the conflict is resolved",
                snapshot.version, self.entity_id
            );
            self.conflicts.park(snapshot);
            return;
        }

        let in_flight = self.queue.in_flight().map(|op| &op.patch.fields);
        let other_pending = self.queue.queued_len() > 0 || self.debounce.has_pending();
        let verdict = conflict::classify(
            &snapshot,
            self.known_version,
            &self.server.fields,
            in_flight,
            other_pending,
        );

        match verdict {
            SnapshotVerdict::Stale => {
                debug!(
                    "Ignoring stale snapshot {} for entity {} (known {})",
                    snapshot.version, self.entity_id, self.known_version
                );
            }
            SnapshotVerdict::Adopt | SnapshotVerdict::Echo => self.adopt(snapshot),
            SnapshotVerdict::Conflict => self.raise_conflict(snapshot),
        }
    }

    fn adopt(&mut self, snapshot: Snapshot) {
        debug!("Adopting snapshot {} for entity {}", snapshot.version, self.entity_id);
        self.known_version = self.known_version.max(snapshot.version);
        let version = snapshot.version;
        self.server = snapshot.clone();
        self.baseline = snapshot;
        self.emit(SyncEvent::BaselineUpdated {
            entity_id: self.entity_id,
            version,
        });
    }

    fn raise_conflict(&mut self, snapshot: Snapshot) {
        self.server = snapshot.clone();
        let record = ConflictRecord::new(self.local_view(), snapshot);
        info!(
            "Conflict on entity {} at {} ({} divergent fields, strategy {})",
            self.entity_id,
            record.detected_version,
            record.divergent_fields().len(),
            self.ctx.strategy.name()
        );
        self.known_version = self.known_version.max(record.detected_version);
        self.conflicts.raise(record.clone());
        self.emit(SyncEvent::Conflict(record.clone()));

        let resolution = conflict::resolve(&self.ctx.strategy, &record);
        self.apply_resolution(resolution);
    }

    fn resolve_manually(&mut self, choice: ManualChoice) -> SyncResult<()> {
        if self.conflicts.state() != ConflictState::Conflicted {
            return Err(SyncError::NoConflict(self.entity_id));
        }
        info!("Conflict on entity {} resolved by user: {:?}", self.entity_id, choice);
        self.apply_resolution(conflict::resolve_manual(choice));
        Ok(())
    }

    fn apply_resolution(&mut self, resolution: Resolution) {
        if matches!(resolution, Resolution::AwaitUser) {
            info!("Draining paused for entity {} until the conflict is resolved", self.entity_id);
            return;
        }
        let Some(record) = self.conflicts.begin_resolving() else {
            return;
        };
        let remote = record.remote;

        match resolution {
            Resolution::KeepLocal => {
                self.emit(SyncEvent::RemoteOverridden {
                    entity_id: self.entity_id,
                    version: remote.version,
                });
            }
            Resolution::TakeRemote => {
                let (dropped_ops, dropped_fields) = self.drop_local_edits();
                let version = remote.version;
                self.baseline = remote;
                self.emit(SyncEvent::BaselineUpdated {
                    entity_id: self.entity_id,
                    version,
                });
                self.emit(SyncEvent::LocalEditsDropped {
                    entity_id: self.entity_id,
                    dropped_ops,
                    dropped_fields,
                });
            }
            Resolution::Merged { baseline, merge } => {
                self.queue
                    .rebase_queued(|fields| conflict::rebase_fields(fields, &remote.fields, &merge));
                self.debounce
                    .rebase_pending(|fields| conflict::rebase_fields(fields, &remote.fields, &merge));
                let version = remote.version;
                self.baseline = Snapshot::new(self.entity_id, version, baseline);
                self.emit(SyncEvent::ConflictMerged {
                    entity_id: self.entity_id,
                    version,
                });
            }
            Resolution::AwaitUser => {}
        }

        let parked = self.conflicts.finish();
        if !self.queue.has_unacknowledged()
            && !self.debounce.has_pending()
            && matches!(self.status.underlying(), SaveStatus::Saving | SaveStatus::Error)
        {
            if let Some(status) = self.status.on_idle() {
                self.report_status(status);
            }
        }
        if let Some(snapshot) = parked {
            self.handle_snapshot(snapshot);
        }
    }

    /// Drops an open conflict once no local edit is left unacknowledged.
    fn clear_settled_conflict(&mut self) {
        if self.conflicts.state() != ConflictState::Conflicted
            || self.queue.has_unacknowledged()
            || self.debounce.has_pending()
        {
            return;
        }
        info!(
            "Conflict on entity {} cleared: local edits settled",
            self.entity_id
        );
        let parked = self.conflicts.finish();
        self.emit(SyncEvent::ConflictCleared {
            entity_id: self.entity_id,
        });
        if let Some(snapshot) = parked {
            self.handle_snapshot(snapshot);
        }
    }

    fn local_view(&self) -> Fields {
        let mut view = self.baseline.fields.clone();
        if let Some(op) = self.queue.in_flight() {
            apply_fields(&mut view, &op.patch.fields);
        }
        for op in self.queue.queued() {
            apply_fields(&mut view, &op.patch.fields);
        }
        if let Some(pending) = self.debounce.pending_fields() {
            apply_fields(&mut view, pending);
        }
        view
    }

    // ── Connectivity & status ────────────────────────────────────

    fn handle_connectivity(&mut self, connectivity: Connectivity) {
        self.online = connectivity.is_online();
        if self.online && self.queue.has_unacknowledged() {
            debug!("Entity {} back online; resuming queue", self.entity_id);
        }
        if let Some(status) = self.status.set_offline(!self.online) {
            self.report_status(status);
        }
    }

    fn expire_status(&mut self) {
        if let Some(status) = self.status.expire(Instant::now()) {
            self.report_status(status);
        }
    }

    fn report_status(&self, status: SaveStatus) {
        let _ = self
            .ctx
            .status_tx
            .send(StatusUpdate::Changed(self.entity_id, status));
        self.emit(SyncEvent::StatusChanged {
            entity_id: self.entity_id,
            status,
        });
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.ctx.events.send(event);
    }

    fn info(&self) -> EntityInfo {
        EntityInfo {
            entity_id: self.entity_id,
            status: self.status.current(),
            baseline: self.baseline.clone(),
            known_version: self.known_version,
            pending_fields: self.debounce.pending_fields().cloned().unwrap_or_default(),
            in_flight: self.queue.in_flight().map(|op| op.patch.clone()),
            queued: self.queue.queued().map(|op| op.patch.clone()).collect(),
            paused: self.queue.paused().is_some(),
            conflict_state: self.conflicts.state(),
            conflict: self.conflicts.record().cloned(),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_snapshot(feed: &mut Option<mpsc::Receiver<Snapshot>>) -> Option<Snapshot> {
    match feed {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
