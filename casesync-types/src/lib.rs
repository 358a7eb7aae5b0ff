//! Core type definitions for CaseSync.
//!
//! This crate defines the data model shared by the sync engine and its
//! collaborators (persistence backends, change feeds, presentation layers):
//! - Entity identifiers (UUID v7)
//! - Server-issued versions
//! - Field patches and entity snapshots
//! - Save status and conflict records
//!
//! Nothing here performs I/O; the engine itself lives in `casesync-sync`.

mod conflict;
mod ids;
mod patch;
mod status;
mod version;

pub use conflict::ConflictRecord;
pub use ids::EntityId;
pub use patch::{FieldPatch, FieldValue, Fields, Seq, Snapshot, apply_fields};
pub use status::SaveStatus;
pub use version::Version;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid version: {0}")]
    InvalidVersion(String),

    #[error("unknown save status: {0}")]
    UnknownStatus(String),
}
