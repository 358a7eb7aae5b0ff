//! Change feed abstraction.
//!
//! The change feed pushes the authoritative snapshot of an entity whenever
//! it changes server-side, including echoes of this client's own writes.

use crate::error::SyncResult;
use async_trait::async_trait;
use casesync_types::{EntityId, Snapshot};
use tokio::sync::mpsc;

/// A push subscription source for entity snapshots.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Subscribes to one entity. The receiver yields every pushed snapshot
    /// and ends when the subscription is dropped server-side.
    async fn subscribe(&self, entity_id: EntityId) -> SyncResult<mpsc::Receiver<Snapshot>>;
}

/// An in-memory change feed for testing.
pub mod mock {
    use super::*;
    use crate::error::SyncError;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tracing::warn;

    /// Capacity of each mock subscription channel.
    const SUBSCRIPTION_BUFFER: usize = 64;

    /// A change feed whose pushes are driven by the test (or by
    /// [`crate::persistence::mock::MockPersistence`] echoing writes).
    #[derive(Debug, Clone, Default)]
    pub struct MockFeed {
        subscribers: Arc<Mutex<HashMap<EntityId, Vec<mpsc::Sender<Snapshot>>>>>,
        refuse: Arc<Mutex<bool>>,
    }

    impl MockFeed {
        /// Creates a feed with no subscribers.
        pub fn new() -> Self {
            Self::default()
        }

        /// Pushes a snapshot to every live subscriber of its entity.
        /// Returns how many subscribers received it.
        pub fn push(&self, snapshot: Snapshot) -> usize {
            let mut subscribers = self.subscribers.lock().unwrap();
            let Some(senders) = subscribers.get_mut(&snapshot.entity_id) else {
                return 0;
            };
            senders.retain(|tx| !tx.is_closed());
            let mut delivered = 0;
            for tx in senders.iter() {
                match tx.try_send(snapshot.clone()) {
                    Ok(()) => delivered += 1,
                    Err(e) => warn!("Mock feed dropped snapshot for {}: {}", snapshot.entity_id, e),
                }
            }
            delivered
        }

        /// Number of live subscriptions for an entity.
        pub fn subscriber_count(&self, entity_id: &EntityId) -> usize {
            self.subscribers
                .lock()
                .unwrap()
                .get(entity_id)
                .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
                .unwrap_or(0)
        }

        /// Makes subsequent subscriptions fail (or succeed again).
        pub fn refuse_subscriptions(&self, refuse: bool) {
            *self.refuse.lock().unwrap() = refuse;
        }
    }

    #[async_trait]
    impl ChangeFeed for MockFeed {
        async fn subscribe(&self, entity_id: EntityId) -> SyncResult<mpsc::Receiver<Snapshot>> {
            if *self.refuse.lock().unwrap() {
                return Err(SyncError::Feed(format!("subscription refused for {entity_id}")));
            }
            let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
            self.subscribers
                .lock()
                .unwrap()
                .entry(entity_id)
                .or_default()
                .push(tx);
            Ok(rx)
        }
    }
}
