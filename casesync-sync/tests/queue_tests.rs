use casesync_sync::queue::{FailureOutcome, PauseReason};
use casesync_sync::{MutationQueue, RetryPolicy, WriteError};
use casesync_types::{EntityId, FieldPatch, Seq};
use pretty_assertions::assert_eq;
use std::time::Duration;
use tokio::time::Instant;

fn patch(id: EntityId, seq: u64, field: &str) -> FieldPatch {
    FieldPatch::new(id, Seq::new(seq)).with_field(field, seq)
}

fn network() -> WriteError {
    WriteError::Network("connection reset".into())
}

// ── RetryPolicy ──────────────────────────────────────────────────

#[test]
fn retry_delay_doubles_up_to_cap() {
    let policy = RetryPolicy {
        max_attempts: 10,
        base_delay_ms: 500,
        max_delay_ms: 3_000,
    };
    assert_eq!(policy.delay_after(1), Duration::from_millis(500));
    assert_eq!(policy.delay_after(2), Duration::from_millis(1_000));
    assert_eq!(policy.delay_after(3), Duration::from_millis(2_000));
    assert_eq!(policy.delay_after(4), Duration::from_millis(3_000));
    assert_eq!(policy.delay_after(60), Duration::from_millis(3_000));
}

#[test]
fn retry_budget_counts_first_attempt() {
    let policy = RetryPolicy::default();
    assert!(policy.allows_retry(1));
    assert!(policy.allows_retry(2));
    assert!(!policy.allows_retry(3));
}

// ── Ordering ─────────────────────────────────────────────────────

#[test]
fn one_in_flight_in_fifo_order() {
    let id = EntityId::new();
    let mut queue = MutationQueue::new();
    queue.enqueue(patch(id, 1, "a"));
    queue.enqueue(patch(id, 2, "b"));

    let first = queue.start_next().unwrap();
    assert_eq!(first.patch.seq, Seq::new(1));
    assert_eq!(first.attempts, 1);
    assert!(queue.start_next().is_none());

    assert!(queue.complete_success(Seq::new(1)).is_some());
    assert_eq!(queue.start_next().unwrap().patch.seq, Seq::new(2));
    assert!(queue.complete_success(Seq::new(2)).is_some());
    assert!(!queue.has_unacknowledged());
}

#[test]
fn completion_for_other_seq_is_ignored() {
    let id = EntityId::new();
    let mut queue = MutationQueue::new();
    queue.enqueue(patch(id, 1, "a"));
    queue.start_next();

    assert!(queue.complete_success(Seq::new(7)).is_none());
    assert!(queue.in_flight().is_some());
}

// ── Failures ─────────────────────────────────────────────────────

#[test]
fn retryable_failure_keeps_head_and_backs_off() {
    let id = EntityId::new();
    let policy = RetryPolicy::default();
    let now = Instant::now();
    let mut queue = MutationQueue::new();
    queue.enqueue(patch(id, 1, "a"));
    queue.enqueue(patch(id, 2, "b"));
    queue.start_next();

    let outcome = queue.complete_failure(Seq::new(1), network(), &policy, now);
    assert_eq!(
        outcome,
        Some(FailureOutcome::Retry {
            seq: Seq::new(1),
            attempt: 1,
            delay: Duration::from_millis(500),
        })
    );
    assert_eq!(queue.retry_at(), Some(now + Duration::from_millis(500)));
    assert!(queue.start_next().is_none());

    queue.backoff_elapsed();
    let head = queue.start_next().unwrap();
    assert_eq!(head.patch.seq, Seq::new(1));
    assert_eq!(head.attempts, 2);
}

#[test]
fn exhausted_retries_pause_with_head_still_queued() {
    let id = EntityId::new();
    let policy = RetryPolicy::default();
    let now = Instant::now();
    let mut queue = MutationQueue::new();
    queue.enqueue(patch(id, 1, "a"));

    for attempt in 1..=3 {
        queue.backoff_elapsed();
        assert_eq!(queue.start_next().unwrap().attempts, attempt);
        let outcome = queue.complete_failure(Seq::new(1), network(), &policy, now);
        if attempt < 3 {
            assert!(matches!(outcome, Some(FailureOutcome::Retry { .. })));
        } else {
            assert_eq!(
                outcome,
                Some(FailureOutcome::Exhausted {
                    seq: Seq::new(1),
                    attempts: 3,
                })
            );
        }
    }

    assert_eq!(queue.paused(), Some(&PauseReason::RetriesExhausted(network())));
    assert_eq!(queue.queued_len(), 1);
    assert!(queue.start_next().is_none());
}

#[test]
fn validation_error_drops_only_the_offending_op() {
    let id = EntityId::new();
    let policy = RetryPolicy::default();
    let mut queue = MutationQueue::new();
    queue.enqueue(patch(id, 1, "a"));
    queue.enqueue(patch(id, 2, "b"));
    queue.start_next();

    let error = WriteError::Validation("phone number malformed".into());
    let outcome = queue.complete_failure(Seq::new(1), error.clone(), &policy, Instant::now());

    match outcome {
        Some(FailureOutcome::Rejected { op }) => assert_eq!(op.patch.seq, Seq::new(1)),
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(queue.paused(), Some(&PauseReason::Rejected(error)));
    assert_eq!(queue.queued().map(|op| op.patch.seq).collect::<Vec<_>>(), vec![Seq::new(2)]);
}

#[test]
fn resume_starts_a_fresh_retry_cycle() {
    let id = EntityId::new();
    let policy = RetryPolicy {
        max_attempts: 1,
        ..RetryPolicy::default()
    };
    let mut queue = MutationQueue::new();
    queue.enqueue(patch(id, 1, "a"));
    queue.start_next();
    queue.complete_failure(Seq::new(1), network(), &policy, Instant::now());
    assert!(queue.paused().is_some());

    assert!(queue.resume());
    assert!(!queue.resume());
    assert_eq!(queue.start_next().unwrap().attempts, 1);
}

#[test]
fn new_edit_lifts_pause() {
    let id = EntityId::new();
    let policy = RetryPolicy::default();
    let mut queue = MutationQueue::new();
    queue.enqueue(patch(id, 1, "a"));
    queue.start_next();
    queue.complete_failure(
        Seq::new(1),
        WriteError::Validation("bad".into()),
        &policy,
        Instant::now(),
    );

    assert!(queue.enqueue(patch(id, 2, "b")));
    assert!(queue.paused().is_none());
    assert_eq!(queue.start_next().unwrap().patch.seq, Seq::new(2));
}

// ── Discard & rebase ─────────────────────────────────────────────

#[test]
fn discard_keeps_in_flight() {
    let id = EntityId::new();
    let mut queue = MutationQueue::new();
    queue.enqueue(patch(id, 1, "a"));
    queue.enqueue(patch(id, 2, "b"));
    queue.enqueue(patch(id, 3, "c"));
    queue.start_next();

    let dropped = queue.discard_queued();
    assert_eq!(dropped.len(), 2);
    assert_eq!(queue.in_flight().unwrap().patch.seq, Seq::new(1));
    assert_eq!(queue.queued_len(), 0);
}

#[test]
fn rebase_drops_emptied_ops() {
    let id = EntityId::new();
    let mut queue = MutationQueue::new();
    queue.enqueue(patch(id, 1, "a"));
    queue.enqueue(patch(id, 2, "b"));

    queue.rebase_queued(|fields| {
        fields.remove("a");
    });

    assert_eq!(queue.queued().map(|op| op.patch.seq).collect::<Vec<_>>(), vec![Seq::new(2)]);
}
