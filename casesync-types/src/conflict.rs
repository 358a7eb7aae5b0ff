//! Concurrent-modification records.

use crate::{EntityId, Fields, Snapshot, Version};
use serde::{Deserialize, Serialize};

/// Divergence between unacknowledged local edits and a newer remote snapshot.
///
/// Created by the engine when a change-feed push is newer than anything this
/// client wrote or accepted while local edits are still pending. Lives until
/// a resolution strategy disposes of it; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// The entity in conflict.
    pub entity_id: EntityId,
    /// Local view: the baseline with every unacknowledged edit applied.
    pub local: Fields,
    /// The pushed remote snapshot.
    pub remote: Snapshot,
    /// Version of the remote snapshot that triggered the conflict.
    pub detected_version: Version,
}

impl ConflictRecord {
    /// Creates a record from the local view and the offending snapshot.
    pub fn new(local: Fields, remote: Snapshot) -> Self {
        Self {
            entity_id: remote.entity_id,
            detected_version: remote.version,
            local,
            remote,
        }
    }

    /// Fields whose local and remote values differ.
    pub fn divergent_fields(&self) -> Vec<&str> {
        self.remote.changed_fields(&self.local)
    }
}
