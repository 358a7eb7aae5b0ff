//! Per-entity mutation queue.
//!
//! A FIFO of unacknowledged patches with at most one in flight. The queue is
//! plain state; the entity worker decides when to start a write and feeds
//! the outcome back through [`MutationQueue::complete_success`] or
//! [`MutationQueue::complete_failure`].

use crate::error::WriteError;
use casesync_types::{FieldPatch, Fields, Seq};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Bounded exponential backoff for retryable write failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per patch, first attempt included.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub base_delay_ms: u64,
    /// Ceiling for any single delay.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Whether another attempt is allowed after `attempts` have failed.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// A patch not yet acknowledged by the persistence backend.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
    /// The patch to write.
    pub patch: FieldPatch,
    /// Attempts made so far in the current retry cycle.
    pub attempts: u32,
}

/// Why draining is suspended after a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PauseReason {
    /// The head exhausted its retry budget.
    RetriesExhausted(WriteError),
    /// The backend rejected a patch; it was dropped.
    Rejected(WriteError),
}

/// What happened after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// The head will be retried once `delay` has elapsed.
    Retry { seq: Seq, attempt: u32, delay: Duration },
    /// The head stays queued but draining is paused.
    Exhausted { seq: Seq, attempts: u32 },
    /// The head was dropped and draining is paused.
    Rejected { op: PendingOperation },
}

/// FIFO of pending operations for one entity.
#[derive(Debug, Default)]
pub struct MutationQueue {
    queued: VecDeque<PendingOperation>,
    in_flight: Option<PendingOperation>,
    paused: Option<PauseReason>,
    retry_at: Option<Instant>,
}

impl MutationQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a patch. A new edit lifts a failure pause and starts a fresh
    /// retry cycle for the head. Returns true if a pause was lifted.
    pub fn enqueue(&mut self, patch: FieldPatch) -> bool {
        self.queued.push_back(PendingOperation { patch, attempts: 0 });
        self.resume()
    }

    /// Lifts a failure pause and any pending backoff. Returns true if the
    /// queue was paused.
    pub fn resume(&mut self) -> bool {
        let was_paused = self.paused.take().is_some();
        if was_paused {
            self.retry_at = None;
            if let Some(head) = self.queued.front_mut() {
                head.attempts = 0;
            }
        }
        was_paused
    }

    /// Whether a write may start now, ignoring connectivity and conflicts.
    pub fn is_ready(&self) -> bool {
        self.in_flight.is_none()
            && self.paused.is_none()
            && self.retry_at.is_none()
            && !self.queued.is_empty()
    }

    /// Moves the head into flight and returns the patch to send.
    pub fn start_next(&mut self) -> Option<&PendingOperation> {
        if !self.is_ready() {
            return None;
        }
        let mut op = self.queued.pop_front()?;
        op.attempts += 1;
        self.in_flight = Some(op);
        self.in_flight.as_ref()
    }

    /// Completes the in-flight operation successfully.
    pub fn complete_success(&mut self, seq: Seq) -> Option<PendingOperation> {
        match &self.in_flight {
            Some(op) if op.patch.seq == seq => self.in_flight.take(),
            _ => None,
        }
    }

    /// Completes the in-flight operation with a failure.
    ///
    /// Retryable errors put the head back at the front of the queue, either
    /// with a backoff deadline or, once the budget is spent, paused.
    /// Non-retryable errors drop the head and pause the rest.
    pub fn complete_failure(
        &mut self,
        seq: Seq,
        error: WriteError,
        policy: &RetryPolicy,
        now: Instant,
    ) -> Option<FailureOutcome> {
        let op = match &self.in_flight {
            Some(op) if op.patch.seq == seq => self.in_flight.take()?,
            _ => return None,
        };

        if !error.is_retryable() {
            self.paused = Some(PauseReason::Rejected(error));
            return Some(FailureOutcome::Rejected { op });
        }

        let attempts = op.attempts;
        self.queued.push_front(op);
        if policy.allows_retry(attempts) {
            let delay = policy.delay_after(attempts);
            self.retry_at = Some(now + delay);
            Some(FailureOutcome::Retry {
                seq,
                attempt: attempts,
                delay,
            })
        } else {
            self.paused = Some(PauseReason::RetriesExhausted(error));
            Some(FailureOutcome::Exhausted { seq, attempts })
        }
    }

    /// Backoff deadline of the head, if one is pending.
    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    /// Clears an elapsed backoff deadline.
    pub fn backoff_elapsed(&mut self) {
        self.retry_at = None;
    }

    /// Drops every queued (not in-flight) operation and lifts any pause.
    pub fn discard_queued(&mut self) -> Vec<PendingOperation> {
        self.paused = None;
        self.retry_at = None;
        self.queued.drain(..).collect()
    }

    /// Rewrites every queued operation's fields; operations left empty are
    /// dropped. The in-flight operation is untouched.
    pub fn rebase_queued(&mut self, mut rebase: impl FnMut(&mut Fields)) {
        for op in &mut self.queued {
            rebase(&mut op.patch.fields);
        }
        self.queued.retain(|op| !op.patch.is_empty());
    }

    /// The in-flight operation.
    pub fn in_flight(&self) -> Option<&PendingOperation> {
        self.in_flight.as_ref()
    }

    /// Queued operations, head first.
    pub fn queued(&self) -> impl Iterator<Item = &PendingOperation> {
        self.queued.iter()
    }

    /// Number of queued (not in-flight) operations.
    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    /// Whether any operation is queued or in flight.
    pub fn has_unacknowledged(&self) -> bool {
        self.in_flight.is_some() || !self.queued.is_empty()
    }

    /// Current failure pause.
    pub fn paused(&self) -> Option<&PauseReason> {
        self.paused.as_ref()
    }
}
