//! Events published to the presentation layer.

use crate::error::WriteError;
use casesync_types::{ConflictRecord, EntityId, SaveStatus, Seq, Version};
use std::time::Duration;

/// Something the UI may want to render.
///
/// Delivered over a `tokio::sync::broadcast` channel from
/// [`crate::SyncEngine::subscribe`]. Slow subscribers may lag and miss
/// events; status can always be re-read through the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Visible save status of one entity changed (or a new attempt began).
    StatusChanged { entity_id: EntityId, status: SaveStatus },
    /// Screen-wide aggregate status changed.
    GlobalStatus(SaveStatus),
    /// A retryable failure; the same patch will be sent again after `delay`.
    RetryScheduled {
        entity_id: EntityId,
        seq: Seq,
        attempt: u32,
        delay: Duration,
    },
    /// A patch used up its retries. It stays queued; draining is paused.
    WriteFailed {
        entity_id: EntityId,
        seq: Seq,
        attempts: u32,
        error: WriteError,
    },
    /// The backend rejected a patch. It was dropped; draining is paused.
    WriteRejected {
        entity_id: EntityId,
        seq: Seq,
        error: WriteError,
    },
    /// The local baseline moved to a new server version.
    BaselineUpdated { entity_id: EntityId, version: Version },
    /// A remote change collided with local edits.
    Conflict(ConflictRecord),
    /// Local edits were kept over a remote change.
    RemoteOverridden { entity_id: EntityId, version: Version },
    /// Local edits were dropped (remote won, or the caller discarded them).
    LocalEditsDropped {
        entity_id: EntityId,
        dropped_ops: usize,
        dropped_fields: Vec<String>,
    },
    /// Local and remote changes were merged.
    ConflictMerged { entity_id: EntityId, version: Version },
    /// The open conflict no longer applies (edits acknowledged or discarded).
    ConflictCleared { entity_id: EntityId },
}

impl SyncEvent {
    /// The entity the event concerns, if it concerns exactly one.
    pub fn entity_id(&self) -> Option<EntityId> {
        match self {
            SyncEvent::GlobalStatus(_) => None,
            SyncEvent::Conflict(record) => Some(record.entity_id),
            SyncEvent::StatusChanged { entity_id, .. }
            | SyncEvent::RetryScheduled { entity_id, .. }
            | SyncEvent::WriteFailed { entity_id, .. }
            | SyncEvent::WriteRejected { entity_id, .. }
            | SyncEvent::BaselineUpdated { entity_id, .. }
            | SyncEvent::RemoteOverridden { entity_id, .. }
            | SyncEvent::LocalEditsDropped { entity_id, .. }
            | SyncEvent::ConflictMerged { entity_id, .. }
            | SyncEvent::ConflictCleared { entity_id } => Some(*entity_id),
        }
    }
}
