use casesync_sync::DebounceAggregator;
use casesync_types::{EntityId, Seq};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

const QUIET: Duration = Duration::from_millis(300);

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[test]
fn nothing_pending_initially() {
    let agg = DebounceAggregator::new(EntityId::new(), QUIET, None);
    assert!(!agg.has_pending());
    assert_eq!(agg.deadline(), None);
    assert_eq!(agg.next_seq(), Seq::FIRST);
}

#[test]
fn edits_within_quiet_period_coalesce() {
    let id = EntityId::new();
    let mut agg = DebounceAggregator::new(id, QUIET, None);
    let t0 = Instant::now();

    agg.submit("customer_name", json!("Kim"), t0);
    agg.submit("memo", json!("sensitive skin"), t0 + ms(100));

    assert_eq!(agg.take_due(t0 + ms(350)), None);
    let patch = agg.take_due(t0 + ms(400)).unwrap();
    assert_eq!(patch.entity_id, id);
    assert_eq!(patch.seq, Seq::FIRST);
    assert_eq!(patch.len(), 2);
    assert_eq!(patch.get("customer_name"), Some(&json!("Kim")));
    assert_eq!(patch.get("memo"), Some(&json!("sensitive skin")));
    assert!(!agg.has_pending());
}

#[test]
fn later_value_for_same_field_wins() {
    let mut agg = DebounceAggregator::new(EntityId::new(), QUIET, None);
    let t0 = Instant::now();

    agg.submit("memo", json!("a"), t0);
    agg.submit("memo", json!("ab"), t0 + ms(50));
    agg.submit("memo", json!("abc"), t0 + ms(80));

    let patch = agg.flush_now().unwrap();
    assert_eq!(patch.len(), 1);
    assert_eq!(patch.get("memo"), Some(&json!("abc")));
}

#[test]
fn each_edit_rearms_deadline() {
    let mut agg = DebounceAggregator::new(EntityId::new(), QUIET, None);
    let t0 = Instant::now();

    assert_eq!(agg.submit("a", json!(1), t0), t0 + QUIET);
    assert_eq!(agg.submit("b", json!(2), t0 + ms(200)), t0 + ms(500));
    assert_eq!(agg.deadline(), Some(t0 + ms(500)));
}

#[test]
fn max_wait_bounds_continuous_editing() {
    let mut agg = DebounceAggregator::new(EntityId::new(), QUIET, Some(ms(1_000)));
    let t0 = Instant::now();

    for i in 0..10 {
        agg.submit("memo", json!(i), t0 + ms(i * 200));
    }

    assert_eq!(agg.deadline(), Some(t0 + ms(1_000)));
    assert!(agg.take_due(t0 + ms(1_000)).is_some());
}

#[test]
fn flush_now_ignores_deadline_and_numbers_patches() {
    let mut agg = DebounceAggregator::new(EntityId::new(), QUIET, None);
    let t0 = Instant::now();

    agg.submit("a", json!(1), t0);
    assert_eq!(agg.flush_now().unwrap().seq, Seq::new(1));
    assert_eq!(agg.flush_now(), None);

    agg.submit("a", json!(2), t0);
    assert_eq!(agg.flush_now().unwrap().seq, Seq::new(2));
    assert_eq!(agg.next_seq(), Seq::new(3));
}

#[test]
fn cancel_returns_dropped_fields_without_consuming_seq() {
    let mut agg = DebounceAggregator::new(EntityId::new(), QUIET, None);
    agg.submit("memo", json!("draft"), Instant::now());

    let dropped = agg.cancel().unwrap();
    assert_eq!(dropped.get("memo"), Some(&json!("draft")));
    assert!(!agg.has_pending());
    assert_eq!(agg.next_seq(), Seq::FIRST);
}

#[test]
fn rebase_pending_drops_emptied_patch() {
    let mut agg = DebounceAggregator::new(EntityId::new(), QUIET, None);
    agg.submit("memo", json!("draft"), Instant::now());

    agg.rebase_pending(|fields| {
        fields.remove("memo");
    });

    assert!(!agg.has_pending());
    assert_eq!(agg.deadline(), None);
}

proptest! {
    #[test]
    fn flushed_patch_holds_last_value_per_field(
        edits in prop::collection::vec((0usize..5, any::<i64>()), 1..40)
    ) {
        let mut agg = DebounceAggregator::new(EntityId::new(), QUIET, None);
        let t0 = Instant::now();
        let mut expected = BTreeMap::new();
        for (i, (field, value)) in edits.iter().enumerate() {
            let name = format!("field_{field}");
            agg.submit(name.clone(), json!(value), t0 + ms(i as u64 * 10));
            expected.insert(name, json!(value));
        }

        let patch = agg.flush_now().unwrap();
        prop_assert_eq!(patch.fields, expected);
        prop_assert!(!agg.has_pending());
    }
}
