//! Per-entity synchronization engine for form-style editors.
//!
//! Keeps a client-side view of editable records consistent with a remote
//! persistence backend while the user types.
//!
//! # Architecture
//!
//! Every open entity gets its own worker task. The worker owns the entity's
//! edits, queue, save status and conflict state, and serializes everything
//! that happens to it through one event loop. The engine is only a registry
//! of workers plus the shared collaborators.
//!
//! ## Components
//!
//! - **Debounce**: coalesces rapid field edits into one patch per quiet period
//! - **Queue**: sends patches strictly in order, one in flight, with retries
//! - **Status**: per-entity and aggregate save status for the UI
//! - **Network**: process-wide online/offline flag gating the queues
//! - **Conflict**: classifies pushed snapshots and applies a resolution
//!   strategy when they collide with unacknowledged edits
//!
//! ## Edit Lifecycle
//!
//! 1. **Edit**: `submit_field_edit` merges the value into the pending patch
//! 2. **Flush**: after the quiet period the patch gets a sequence number
//!    and joins the queue
//! 3. **Write**: the head of the queue is sent once the previous write
//!    completed and the network is online
//! 4. **Acknowledge**: the ack moves the baseline forward; status becomes
//!    `saved`, then `idle`
//!
//! # Example
//!
//! ```
//! use casesync_sync::persistence::mock::MockPersistence;
//! use casesync_sync::{NetworkMonitor, SyncConfig, SyncEngine};
//! use casesync_types::{EntityId, Snapshot};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> casesync_sync::SyncResult<()> {
//! let api = Arc::new(MockPersistence::new());
//! let engine = SyncEngine::new(SyncConfig::default(), api, NetworkMonitor::default());
//!
//! let id = EntityId::new();
//! engine.open(Snapshot::empty(id)).await?;
//! engine.submit_field_edit(id, "title", "Quarterly report").await?;
//! engine.close(id).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod conflict;
pub mod debounce;
mod engine;
mod error;
pub mod events;
pub mod feed;
pub mod network;
pub mod persistence;
pub mod queue;
pub mod status;
mod worker;

pub use config::SyncConfig;
pub use conflict::{ConflictState, ConflictStrategy, ManualChoice, MergeFn, merge_fn};
pub use debounce::DebounceAggregator;
pub use engine::SyncEngine;
pub use error::{SyncError, SyncResult, WriteError};
pub use events::SyncEvent;
pub use feed::ChangeFeed;
pub use network::{Connectivity, NetworkMonitor};
pub use persistence::{PersistenceApi, WriteAck};
pub use queue::{MutationQueue, PendingOperation, RetryPolicy};
pub use status::{SaveStatusTracker, StatusBoard};
pub use worker::EntityInfo;
