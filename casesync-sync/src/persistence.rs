//! Persistence API abstraction.
//!
//! The engine writes patches through [`PersistenceApi`]; any backend (HTTP,
//! RPC, embedded database) can sit behind it. Implementations must be
//! idempotent per `(entity_id, seq)`: a retried patch carries the same
//! sequence number and must not be applied twice.

use crate::error::WriteError;
use async_trait::async_trait;
use casesync_types::{FieldPatch, Fields, Version};

/// Successful write response.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteAck {
    /// Version of the entity after the write.
    pub version: Version,
    /// The fields the backend actually stored (may be normalized).
    pub applied: Fields,
}

/// A backend accepting field patches.
#[async_trait]
pub trait PersistenceApi: Send + Sync {
    /// Writes one patch. `expected_base` is the newest version this client
    /// knows of, for backends that want to detect lost updates themselves.
    async fn write(
        &self,
        patch: &FieldPatch,
        expected_base: Option<Version>,
    ) -> Result<WriteAck, WriteError>;
}

/// An in-memory persistence backend for testing.
pub mod mock {
    use super::*;
    use crate::feed::mock::MockFeed;
    use casesync_types::{EntityId, Seq, Snapshot, apply_fields};
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::Semaphore;
    use tokio::time::Instant;

    /// One write request as observed by the backend.
    #[derive(Debug, Clone, PartialEq)]
    pub struct WriteCall {
        /// Target entity.
        pub entity_id: EntityId,
        /// Client sequence number.
        pub seq: Seq,
        /// Fields sent.
        pub fields: Fields,
        /// Base version the client declared.
        pub expected_base: Option<Version>,
        /// When the request arrived.
        pub at: Instant,
    }

    #[derive(Debug, Default)]
    struct MockState {
        records: HashMap<EntityId, Snapshot>,
        acked: HashMap<(EntityId, Seq), WriteAck>,
        calls: Vec<WriteCall>,
        failures: HashMap<EntityId, VecDeque<WriteError>>,
        in_flight: HashMap<EntityId, usize>,
        max_in_flight: HashMap<EntityId, usize>,
        latency: Duration,
        held: bool,
    }

    /// Decrements the in-flight counter even if the request is dropped by a
    /// client-side timeout.
    struct InFlightGuard {
        state: Arc<Mutex<MockState>>,
        entity_id: EntityId,
    }

    impl Drop for InFlightGuard {
        fn drop(&mut self) {
            let mut state = self.state.lock().unwrap();
            if let Some(n) = state.in_flight.get_mut(&self.entity_id) {
                *n = n.saturating_sub(1);
            }
        }
    }

    /// A scriptable in-memory backend.
    ///
    /// Stores one snapshot per entity, bumps the version on every applied
    /// write, optionally echoes writes to a [`MockFeed`], and records every
    /// request for assertions.
    #[derive(Clone)]
    pub struct MockPersistence {
        state: Arc<Mutex<MockState>>,
        gate: Arc<Semaphore>,
        feed: Option<MockFeed>,
    }

    impl Default for MockPersistence {
        fn default() -> Self {
            Self {
                state: Arc::new(Mutex::new(MockState::default())),
                gate: Arc::new(Semaphore::new(0)),
                feed: None,
            }
        }
    }

    impl MockPersistence {
        /// Creates an empty backend.
        pub fn new() -> Self {
            Self::default()
        }

        /// Creates a backend that echoes every applied write to `feed`.
        pub fn with_feed(feed: MockFeed) -> Self {
            Self {
                feed: Some(feed),
                ..Self::default()
            }
        }

        /// Stores an initial snapshot.
        pub fn seed(&self, snapshot: Snapshot) {
            self.state
                .lock()
                .unwrap()
                .records
                .insert(snapshot.entity_id, snapshot);
        }

        /// Current server-side state of an entity.
        pub fn record(&self, entity_id: &EntityId) -> Option<Snapshot> {
            self.state.lock().unwrap().records.get(entity_id).cloned()
        }

        /// Simulates another client changing an entity. Bumps the version,
        /// pushes the result to the feed and returns it.
        pub fn remote_edit(&self, entity_id: EntityId, fields: Fields) -> Snapshot {
            let snapshot = {
                let mut state = self.state.lock().unwrap();
                let record = state
                    .records
                    .entry(entity_id)
                    .or_insert_with(|| Snapshot::empty(entity_id));
                apply_fields(&mut record.fields, &fields);
                record.version = record.version.next();
                record.clone()
            };
            if let Some(feed) = &self.feed {
                feed.push(snapshot.clone());
            }
            snapshot
        }

        /// Makes the next `times` writes for an entity fail with `error`.
        pub fn fail_next(&self, entity_id: EntityId, error: WriteError, times: usize) {
            let mut state = self.state.lock().unwrap();
            let queue = state.failures.entry(entity_id).or_default();
            for _ in 0..times {
                queue.push_back(error.clone());
            }
        }

        /// Adds a fixed delay to every write.
        pub fn set_latency(&self, latency: Duration) {
            self.state.lock().unwrap().latency = latency;
        }

        /// Holds every subsequent write in flight until released.
        pub fn hold_writes(&self) {
            self.state.lock().unwrap().held = true;
        }

        /// Lets `n` held writes proceed.
        pub fn release_writes(&self, n: usize) {
            self.gate.add_permits(n);
        }

        /// Every request received so far, in arrival order.
        pub fn calls(&self) -> Vec<WriteCall> {
            self.state.lock().unwrap().calls.clone()
        }

        /// Requests received for one entity, in arrival order.
        pub fn calls_for(&self, entity_id: &EntityId) -> Vec<WriteCall> {
            self.state
                .lock()
                .unwrap()
                .calls
                .iter()
                .filter(|c| &c.entity_id == entity_id)
                .cloned()
                .collect()
        }

        /// Highest number of concurrent requests observed for an entity.
        pub fn max_in_flight(&self, entity_id: &EntityId) -> usize {
            self.state
                .lock()
                .unwrap()
                .max_in_flight
                .get(entity_id)
                .copied()
                .unwrap_or(0)
        }

        fn begin(
            &self,
            patch: &FieldPatch,
            expected_base: Option<Version>,
        ) -> (InFlightGuard, bool, Duration) {
            let mut state = self.state.lock().unwrap();
            state.calls.push(WriteCall {
                entity_id: patch.entity_id,
                seq: patch.seq,
                fields: patch.fields.clone(),
                expected_base,
                at: Instant::now(),
            });
            let current = {
                let n = state.in_flight.entry(patch.entity_id).or_insert(0);
                *n += 1;
                *n
            };
            let max = state.max_in_flight.entry(patch.entity_id).or_insert(0);
            *max = (*max).max(current);
            let guard = InFlightGuard {
                state: Arc::clone(&self.state),
                entity_id: patch.entity_id,
            };
            (guard, state.held, state.latency)
        }

        fn finish(&self, patch: &FieldPatch) -> Result<WriteAck, WriteError> {
            let (result, echo) = {
                let mut state = self.state.lock().unwrap();
                if let Some(error) = state
                    .failures
                    .get_mut(&patch.entity_id)
                    .and_then(VecDeque::pop_front)
                {
                    return Err(error);
                }
                if let Some(ack) = state.acked.get(&(patch.entity_id, patch.seq)) {
                    return Ok(ack.clone());
                }
                let record = state
                    .records
                    .entry(patch.entity_id)
                    .or_insert_with(|| Snapshot::empty(patch.entity_id));
                apply_fields(&mut record.fields, &patch.fields);
                record.version = record.version.next();
                let echo = record.clone();
                let ack = WriteAck {
                    version: echo.version,
                    applied: patch.fields.clone(),
                };
                state.acked.insert((patch.entity_id, patch.seq), ack.clone());
                (ack, echo)
            };
            if let Some(feed) = &self.feed {
                feed.push(echo);
            }
            Ok(result)
        }
    }

    #[async_trait]
    impl PersistenceApi for MockPersistence {
        async fn write(
            &self,
            patch: &FieldPatch,
            expected_base: Option<Version>,
        ) -> Result<WriteAck, WriteError> {
            let (_guard, held, latency) = self.begin(patch, expected_base);
            if held {
                let permit = self
                    .gate
                    .acquire()
                    .await
                    .map_err(|_| WriteError::Network("mock gate closed".into()))?;
                permit.forget();
            }
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            self.finish(patch)
        }
    }
}
