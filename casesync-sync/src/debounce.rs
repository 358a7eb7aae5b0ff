//! Field-level debounce and coalescing.
//!
//! Rapid edits to one entity are merged into a single pending patch that is
//! released once the entity has been quiet for the configured period. The
//! aggregator holds no timers of its own: callers pass the current instant
//! in and ask for the next deadline, which keeps it deterministic under test
//! and lets the entity worker drive it from its event loop.

use casesync_types::{EntityId, FieldPatch, FieldValue, Fields, Seq};
use std::time::Duration;
use tokio::time::Instant;

/// Coalesces edits for one entity into sequence-numbered patches.
#[derive(Debug)]
pub struct DebounceAggregator {
    entity_id: EntityId,
    quiet: Duration,
    max_wait: Option<Duration>,
    pending: Option<PendingEdits>,
    next_seq: Seq,
}

#[derive(Debug)]
struct PendingEdits {
    fields: Fields,
    first_edit: Instant,
    last_edit: Instant,
}

impl DebounceAggregator {
    /// Creates an aggregator with the given quiet period and optional
    /// maximum wait.
    pub fn new(entity_id: EntityId, quiet: Duration, max_wait: Option<Duration>) -> Self {
        Self {
            entity_id,
            quiet,
            max_wait,
            pending: None,
            next_seq: Seq::FIRST,
        }
    }

    /// The entity this aggregator serves.
    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    /// Merges an edit into the pending patch and returns the new flush
    /// deadline. The latest value of a field wins.
    pub fn submit(&mut self, field: impl Into<String>, value: FieldValue, now: Instant) -> Instant {
        let pending = self.pending.get_or_insert_with(|| PendingEdits {
            fields: Fields::new(),
            first_edit: now,
            last_edit: now,
        });
        pending.fields.insert(field.into(), value);
        pending.last_edit = now;

        // Deadline is always Some once something is pending.
        self.deadline().unwrap_or(now + self.quiet)
    }

    /// When the pending patch becomes due, if any.
    pub fn deadline(&self) -> Option<Instant> {
        let pending = self.pending.as_ref()?;
        let quiet_deadline = pending.last_edit + self.quiet;
        Some(match self.max_wait {
            Some(max_wait) => quiet_deadline.min(pending.first_edit + max_wait),
            None => quiet_deadline,
        })
    }

    /// Releases the pending patch if its deadline has passed.
    pub fn take_due(&mut self, now: Instant) -> Option<FieldPatch> {
        match self.deadline() {
            Some(deadline) if deadline <= now => self.flush_now(),
            _ => None,
        }
    }

    /// Releases the pending patch immediately, regardless of its deadline.
    pub fn flush_now(&mut self) -> Option<FieldPatch> {
        let pending = self.pending.take()?;
        let seq = self.next_seq;
        self.next_seq = seq.next();
        Some(FieldPatch {
            entity_id: self.entity_id,
            seq,
            fields: pending.fields,
        })
    }

    /// Drops the pending patch without flushing it. Returns the dropped
    /// fields so the caller can report them.
    pub fn cancel(&mut self) -> Option<Fields> {
        self.pending.take().map(|p| p.fields)
    }

    /// Whether any edit is waiting to be flushed.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// The edits waiting to be flushed.
    pub fn pending_fields(&self) -> Option<&Fields> {
        self.pending.as_ref().map(|p| &p.fields)
    }

    /// Rewrites the pending fields in place (used when rebasing local edits
    /// onto a merged baseline). An emptied patch is dropped.
    pub fn rebase_pending(&mut self, rebase: impl FnOnce(&mut Fields)) {
        if let Some(pending) = self.pending.as_mut() {
            rebase(&mut pending.fields);
            if pending.fields.is_empty() {
                self.pending = None;
            }
        }
    }

    /// Sequence number the next flush will carry.
    pub fn next_seq(&self) -> Seq {
        self.next_seq
    }
}
