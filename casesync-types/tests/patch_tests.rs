use casesync_types::{
    ConflictRecord, EntityId, FieldPatch, Fields, SaveStatus, Seq, Snapshot, Version,
    apply_fields,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::json;

fn fields(pairs: &[(&str, serde_json::Value)]) -> Fields {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

// ── FieldPatch ────────────────────────────────────────────────────

#[test]
fn patch_merge_later_value_wins() {
    let id = EntityId::new();
    let mut patch = FieldPatch::new(id, Seq::FIRST)
        .with_field("customer_name", "Kim")
        .with_field("consent_received", false);

    patch.merge(&fields(&[("consent_received", json!(true)), ("memo", json!("dry skin"))]));

    assert_eq!(patch.len(), 3);
    assert_eq!(patch.get("customer_name"), Some(&json!("Kim")));
    assert_eq!(patch.get("consent_received"), Some(&json!(true)));
    assert_eq!(patch.get("memo"), Some(&json!("dry skin")));
}

#[test]
fn patch_empty() {
    let patch = FieldPatch::new(EntityId::new(), Seq::FIRST);
    assert!(patch.is_empty());
    assert_eq!(patch.len(), 0);
}

#[test]
fn seq_is_monotonic() {
    let first = Seq::FIRST;
    assert_eq!(first.get(), 1);
    assert!(first.next() > first);
    assert_eq!(first.next().to_string(), "#2");
}

#[test]
fn patch_json_roundtrip() {
    let patch = FieldPatch::new(EntityId::new(), Seq::new(7)).with_field("age", 31);
    let json = serde_json::to_string(&patch).unwrap();
    let parsed: FieldPatch = serde_json::from_str(&json).unwrap();
    assert_eq!(patch, parsed);
}

// ── Snapshot ──────────────────────────────────────────────────────

#[test]
fn snapshot_changed_fields_covers_both_sides() {
    let snap = Snapshot::new(
        EntityId::new(),
        Version::new(3),
        fields(&[("a", json!(1)), ("b", json!(2)), ("only_remote", json!(true))]),
    );
    let local = fields(&[("a", json!(1)), ("b", json!(5)), ("only_local", json!("x"))]);

    let mut changed = snap.changed_fields(&local);
    changed.sort_unstable();
    assert_eq!(changed, vec!["b", "only_local", "only_remote"]);
}

#[test]
fn snapshot_empty_starts_at_zero() {
    let id = EntityId::new();
    let snap = Snapshot::empty(id);
    assert_eq!(snap.version, Version::ZERO);
    assert!(snap.fields.is_empty());
    assert_eq!(snap.entity_id, id);
}

#[test]
fn conflict_record_takes_remote_identity() {
    let id = EntityId::new();
    let mut remote = Snapshot::empty(id).with_field("memo", "remote");
    remote.version = Version::new(9);
    let record = ConflictRecord::new(fields(&[("memo", json!("local"))]), remote);

    assert_eq!(record.entity_id, id);
    assert_eq!(record.detected_version, Version::new(9));
    assert_eq!(record.divergent_fields(), vec!["memo"]);
}

// ── SaveStatus ────────────────────────────────────────────────────

#[test]
fn save_status_wire_names() {
    for status in SaveStatus::ALL {
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, format!("\"{}\"", status.as_str()));
        assert_eq!(status.as_str().parse::<SaveStatus>().unwrap(), status);
    }
    assert!("pending".parse::<SaveStatus>().is_err());
}

#[test]
fn save_status_terminal() {
    assert!(SaveStatus::Saved.is_terminal());
    assert!(SaveStatus::Error.is_terminal());
    assert!(!SaveStatus::Saving.is_terminal());
    assert!(!SaveStatus::Offline.is_terminal());
    assert_eq!(SaveStatus::default(), SaveStatus::Idle);
}

// ── Properties ────────────────────────────────────────────────────

proptest! {
    #[test]
    fn apply_fields_union_and_last_write_wins(
        edits in proptest::collection::vec(("[a-d]", 0i64..100), 1..40)
    ) {
        let mut merged = Fields::new();
        for (name, value) in &edits {
            let mut single = Fields::new();
            single.insert(name.clone(), json!(value));
            apply_fields(&mut merged, &single);
        }

        for (name, value) in &merged {
            let last = edits.iter().rev().find(|(n, _)| n == name).map(|(_, v)| json!(v));
            prop_assert_eq!(Some(value.clone()), last);
        }
        for (name, _) in &edits {
            prop_assert!(merged.contains_key(name));
        }
    }
}
