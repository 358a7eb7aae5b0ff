//! Save-status tracking.
//!
//! [`SaveStatusTracker`] is the per-entity state machine
//! (`idle -> saving -> saved|error -> idle`) with the network-driven
//! `offline` override. [`StatusBoard`] derives the screen-wide aggregate.

use crate::events::SyncEvent;
use crate::network::{self, Connectivity};
use casesync_types::{EntityId, SaveStatus};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::debug;

/// Save status of one entity.
///
/// Every transition method returns the status to report, or `None` when the
/// visible status did not change.
#[derive(Debug)]
pub struct SaveStatusTracker {
    status: SaveStatus,
    offline: bool,
    grace: Duration,
    revert_at: Option<Instant>,
    reported: SaveStatus,
}

impl SaveStatusTracker {
    /// Creates an idle tracker. `grace` is how long `saved` stays visible.
    pub fn new(grace: Duration, offline: bool) -> Self {
        let mut tracker = Self {
            status: SaveStatus::Idle,
            offline,
            grace,
            revert_at: None,
            reported: SaveStatus::Idle,
        };
        tracker.reported = tracker.current();
        tracker
    }

    /// The visible status: `offline` overrides everything else.
    pub fn current(&self) -> SaveStatus {
        if self.offline {
            SaveStatus::Offline
        } else {
            self.status
        }
    }

    /// The status underneath a possible `offline` override.
    pub fn underlying(&self) -> SaveStatus {
        self.status
    }

    /// A new edit clears a terminal status immediately.
    pub fn on_edit(&mut self) -> Option<SaveStatus> {
        if self.status.is_terminal() {
            self.set(SaveStatus::Idle)
        } else {
            None
        }
    }

    /// Work was queued (or a paused queue was resumed).
    pub fn on_queued(&mut self) -> Option<SaveStatus> {
        self.set(SaveStatus::Saving)
    }

    /// Attempt number `attempt` (1-based) of a write is starting. Retries
    /// are reported even though the status stays `saving`, so the UI sees
    /// every attempt.
    pub fn on_attempt(&mut self, attempt: u32) -> Option<SaveStatus> {
        let report = self.set(SaveStatus::Saving);
        if report.is_none() && attempt > 1 && !self.offline {
            return Some(SaveStatus::Saving);
        }
        report
    }

    /// Every pending write was acknowledged.
    pub fn on_saved(&mut self, now: Instant) -> Option<SaveStatus> {
        let report = self.set(SaveStatus::Saved);
        self.revert_at = Some(now + self.grace);
        report
    }

    /// A write failed terminally. `error` stays until an edit, a retry or a
    /// discard clears it.
    pub fn on_error(&mut self) -> Option<SaveStatus> {
        self.set(SaveStatus::Error)
    }

    /// Nothing is pending any more (discard, or retry of an empty queue).
    pub fn on_idle(&mut self) -> Option<SaveStatus> {
        self.set(SaveStatus::Idle)
    }

    /// Applies a connectivity change.
    pub fn set_offline(&mut self, offline: bool) -> Option<SaveStatus> {
        self.offline = offline;
        self.report()
    }

    /// When `saved` reverts to `idle`, if pending.
    pub fn revert_at(&self) -> Option<Instant> {
        self.revert_at
    }

    /// Reverts `saved` to `idle` once the grace period has passed.
    pub fn expire(&mut self, now: Instant) -> Option<SaveStatus> {
        match self.revert_at {
            Some(at) if at <= now && self.status == SaveStatus::Saved => self.set(SaveStatus::Idle),
            Some(at) if at <= now => {
                self.revert_at = None;
                None
            }
            _ => None,
        }
    }

    fn set(&mut self, status: SaveStatus) -> Option<SaveStatus> {
        self.status = status;
        self.revert_at = None;
        self.report()
    }

    fn report(&mut self) -> Option<SaveStatus> {
        let current = self.current();
        if current == self.reported {
            None
        } else {
            self.reported = current;
            Some(current)
        }
    }
}

/// Aggregate status over many entities.
///
/// Precedence: `offline`, then `error`, `saving`, `saved`, `idle`.
#[derive(Debug, Default)]
pub struct StatusBoard {
    entities: HashMap<EntityId, SaveStatus>,
    offline: bool,
    last: Option<SaveStatus>,
}

impl StatusBoard {
    /// Creates an empty board.
    pub fn new(offline: bool) -> Self {
        Self {
            entities: HashMap::new(),
            offline,
            last: None,
        }
    }

    /// Records an entity's status; returns the aggregate if it changed.
    pub fn update(&mut self, entity_id: EntityId, status: SaveStatus) -> Option<SaveStatus> {
        self.entities.insert(entity_id, status);
        self.recompute()
    }

    /// Forgets a closed entity; returns the aggregate if it changed.
    pub fn remove(&mut self, entity_id: &EntityId) -> Option<SaveStatus> {
        self.entities.remove(entity_id);
        self.recompute()
    }

    /// Applies a connectivity change; returns the aggregate if it changed.
    pub fn set_offline(&mut self, offline: bool) -> Option<SaveStatus> {
        self.offline = offline;
        self.recompute()
    }

    /// The current aggregate.
    pub fn aggregate(&self) -> SaveStatus {
        aggregate(self.offline, self.entities.values().copied())
    }

    /// Status last recorded for an entity.
    pub fn get(&self, entity_id: &EntityId) -> Option<SaveStatus> {
        self.entities.get(entity_id).copied()
    }

    fn recompute(&mut self) -> Option<SaveStatus> {
        let aggregate = self.aggregate();
        if self.last == Some(aggregate) {
            None
        } else {
            self.last = Some(aggregate);
            Some(aggregate)
        }
    }
}

/// Derives the aggregate status from per-entity statuses.
pub fn aggregate(offline: bool, statuses: impl IntoIterator<Item = SaveStatus>) -> SaveStatus {
    if offline {
        return SaveStatus::Offline;
    }
    let mut any_saving = false;
    let mut any_saved = false;
    for status in statuses {
        match status {
            SaveStatus::Error => return SaveStatus::Error,
            SaveStatus::Saving => any_saving = true,
            SaveStatus::Saved => any_saved = true,
            // Per-entity offline only exists while the board is offline too.
            SaveStatus::Offline | SaveStatus::Idle => {}
        }
    }
    if any_saving {
        SaveStatus::Saving
    } else if any_saved {
        SaveStatus::Saved
    } else {
        SaveStatus::Idle
    }
}

/// Status change reported by an entity worker to the board task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatusUpdate {
    Changed(EntityId, SaveStatus),
    Removed(EntityId),
}

/// Owns the [`StatusBoard`] and republishes the aggregate whenever an
/// entity's status or the connectivity changes. Ends once every worker and
/// the engine have dropped their update senders.
pub(crate) async fn run_board(
    mut updates: mpsc::UnboundedReceiver<StatusUpdate>,
    mut connectivity: watch::Receiver<Connectivity>,
    events: broadcast::Sender<SyncEvent>,
    global: watch::Sender<SaveStatus>,
) {
    let offline = !connectivity.borrow_and_update().is_online();
    let mut board = StatusBoard::new(offline);
    board.recompute();
    global.send_replace(board.aggregate());

    loop {
        let changed = tokio::select! {
            update = updates.recv() => match update {
                Some(StatusUpdate::Changed(entity_id, status)) => board.update(entity_id, status),
                Some(StatusUpdate::Removed(entity_id)) => board.remove(&entity_id),
                None => break,
            },
            now = network::next_transition(&mut connectivity) => board.set_offline(!now.is_online()),
        };
        if let Some(aggregate) = changed {
            debug!("Aggregate status is now {}", aggregate);
            global.send_replace(aggregate);
            let _ = events.send(SyncEvent::GlobalStatus(aggregate));
        }
    }
}
