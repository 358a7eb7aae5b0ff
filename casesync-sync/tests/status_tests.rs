use casesync_sync::status::aggregate;
use casesync_sync::{SaveStatusTracker, StatusBoard};
use casesync_types::{EntityId, SaveStatus};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::time::Duration;
use tokio::time::Instant;

const GRACE: Duration = Duration::from_secs(2);

// ── SaveStatusTracker ────────────────────────────────────────────

#[test]
fn happy_path() {
    let mut tracker = SaveStatusTracker::new(GRACE, false);
    let now = Instant::now();

    assert_eq!(tracker.current(), SaveStatus::Idle);
    assert_eq!(tracker.on_queued(), Some(SaveStatus::Saving));
    assert_eq!(tracker.on_attempt(1), None);
    assert_eq!(tracker.on_saved(now), Some(SaveStatus::Saved));
    assert_eq!(tracker.revert_at(), Some(now + GRACE));

    assert_eq!(tracker.expire(now + Duration::from_secs(1)), None);
    assert_eq!(tracker.expire(now + GRACE), Some(SaveStatus::Idle));
    assert_eq!(tracker.revert_at(), None);
}

#[test]
fn retries_are_reported_while_saving() {
    let mut tracker = SaveStatusTracker::new(GRACE, false);
    tracker.on_queued();

    assert_eq!(tracker.on_attempt(1), None);
    assert_eq!(tracker.on_attempt(2), Some(SaveStatus::Saving));
    assert_eq!(tracker.on_attempt(3), Some(SaveStatus::Saving));
    assert_eq!(tracker.on_error(), Some(SaveStatus::Error));
}

#[test]
fn error_persists_until_edit() {
    let mut tracker = SaveStatusTracker::new(GRACE, false);
    tracker.on_queued();
    tracker.on_error();

    assert_eq!(tracker.revert_at(), None);
    assert_eq!(tracker.expire(Instant::now() + GRACE * 10), None);
    assert_eq!(tracker.current(), SaveStatus::Error);
    assert_eq!(tracker.on_edit(), Some(SaveStatus::Idle));
}

#[test]
fn edit_clears_saved_immediately() {
    let mut tracker = SaveStatusTracker::new(GRACE, false);
    tracker.on_queued();
    tracker.on_saved(Instant::now());

    assert_eq!(tracker.on_edit(), Some(SaveStatus::Idle));
    assert_eq!(tracker.revert_at(), None);
    assert_eq!(tracker.on_edit(), None);
}

#[test]
fn offline_overrides_and_restores() {
    let mut tracker = SaveStatusTracker::new(GRACE, false);
    tracker.on_queued();

    assert_eq!(tracker.set_offline(true), Some(SaveStatus::Offline));
    assert_eq!(tracker.on_error(), None);
    assert_eq!(tracker.underlying(), SaveStatus::Error);
    assert_eq!(tracker.set_offline(false), Some(SaveStatus::Error));
}

#[test]
fn offline_suppresses_retry_reports() {
    let mut tracker = SaveStatusTracker::new(GRACE, true);
    assert_eq!(tracker.current(), SaveStatus::Offline);
    assert_eq!(tracker.on_queued(), None);
    assert_eq!(tracker.on_attempt(2), None);
}

// ── Aggregation ──────────────────────────────────────────────────

#[test]
fn aggregate_precedence() {
    use SaveStatus::*;
    assert_eq!(aggregate(false, Vec::<SaveStatus>::new()), Idle);
    assert_eq!(aggregate(false, [Idle, Saved]), Saved);
    assert_eq!(aggregate(false, [Saved, Saving, Idle]), Saving);
    assert_eq!(aggregate(false, [Saving, Error, Saved]), Error);
    assert_eq!(aggregate(true, [Saving, Error]), Offline);
}

#[test]
fn board_reports_only_changes() {
    let a = EntityId::new();
    let b = EntityId::new();
    let mut board = StatusBoard::new(false);

    assert_eq!(board.update(a, SaveStatus::Saving), Some(SaveStatus::Saving));
    assert_eq!(board.update(b, SaveStatus::Saving), None);
    assert_eq!(board.update(a, SaveStatus::Saved), None);
    assert_eq!(board.update(b, SaveStatus::Error), Some(SaveStatus::Error));
    assert_eq!(board.set_offline(true), Some(SaveStatus::Offline));
    assert_eq!(board.set_offline(false), Some(SaveStatus::Error));
    assert_eq!(board.remove(&b), Some(SaveStatus::Saved));
    assert_eq!(board.get(&a), Some(SaveStatus::Saved));
    assert_eq!(board.get(&b), None);
}

fn any_status() -> impl Strategy<Value = SaveStatus> {
    prop::sample::select(SaveStatus::ALL.to_vec())
}

proptest! {
    #[test]
    fn aggregate_matches_precedence_order(
        statuses in prop::collection::vec(any_status(), 0..12),
        offline in any::<bool>(),
    ) {
        let result = aggregate(offline, statuses.iter().copied());
        let has = |s: SaveStatus| statuses.contains(&s);
        let expected = if offline {
            SaveStatus::Offline
        } else if has(SaveStatus::Error) {
            SaveStatus::Error
        } else if has(SaveStatus::Saving) {
            SaveStatus::Saving
        } else if has(SaveStatus::Saved) {
            SaveStatus::Saved
        } else {
            SaveStatus::Idle
        };
        prop_assert_eq!(result, expected);
    }

    #[test]
    fn aggregate_ignores_order(mut statuses in prop::collection::vec(any_status(), 0..12)) {
        let forward = aggregate(false, statuses.iter().copied());
        statuses.reverse();
        prop_assert_eq!(forward, aggregate(false, statuses));
    }
}
