//! Error types for the sync layer.

use casesync_types::EntityId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors returned by the engine's inbound API.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The entity has not been opened (or was already closed).
    #[error("entity not open: {0}")]
    EntityNotOpen(EntityId),

    /// The entity is already open.
    #[error("entity already open: {0}")]
    AlreadyOpen(EntityId),

    /// `resolve_conflict` was called while no conflict awaits a decision.
    #[error("no pending conflict for entity {0}")]
    NoConflict(EntityId),

    /// Subscribing to the change feed failed.
    #[error("change feed error: {0}")]
    Feed(String),

    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// The entity worker is gone.
    #[error("channel closed")]
    ChannelClosed,
}

/// Failure reported by the persistence backend for one write attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum WriteError {
    /// Transport-level failure; retried with backoff.
    #[error("network error: {0}")]
    Network(String),

    /// The request exceeded the configured timeout; retried like a network
    /// error.
    #[error("request timed out")]
    Timeout,

    /// The backend rejected the patch. Never retried.
    #[error("validation error: {0}")]
    Validation(String),
}

impl WriteError {
    /// Whether the same patch may be sent again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WriteError::Network(_) | WriteError::Timeout)
    }
}
