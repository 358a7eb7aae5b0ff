use casesync_types::{EntityId, Version};
use std::collections::HashSet;
use std::str::FromStr;

// ── EntityId ──────────────────────────────────────────────────────

#[test]
fn entity_id_new_is_unique() {
    let a = EntityId::new();
    let b = EntityId::new();
    assert_ne!(a, b);
}

#[test]
fn entity_id_from_uuid_roundtrip() {
    let uuid = uuid::Uuid::now_v7();
    let id = EntityId::from_uuid(uuid);
    assert_eq!(id.as_uuid(), uuid);
}

#[test]
fn entity_id_display_and_parse() {
    let id = EntityId::new();
    let parsed = EntityId::parse(&id.to_string()).unwrap();
    assert_eq!(id, parsed);
}

#[test]
fn entity_id_from_str_invalid() {
    assert!(EntityId::from_str("case-42").is_err());
}

#[test]
fn entity_id_hash_and_eq() {
    let id = EntityId::new();
    let mut set = HashSet::new();
    set.insert(id);
    set.insert(id);
    assert_eq!(set.len(), 1);
}

#[test]
fn entity_id_serializes_as_plain_string() {
    let id = EntityId::new();
    let json = serde_json::to_string(&id).unwrap();
    assert_eq!(json, format!("\"{id}\""));
}

// ── Version ───────────────────────────────────────────────────────

#[test]
fn version_ordering() {
    let v1 = Version::new(1);
    let v2 = Version::new(2);
    assert!(v2.is_newer_than(&v1));
    assert!(!v1.is_newer_than(&v2));
    assert!(!v1.is_newer_than(&v1));
    assert_eq!(v1.next(), v2);
}

#[test]
fn version_zero_is_default() {
    assert_eq!(Version::default(), Version::ZERO);
    assert_eq!(Version::ZERO.get(), 0);
}

#[test]
fn version_display_and_parse() {
    let v = Version::new(17);
    assert_eq!(v.to_string(), "v17");
    assert_eq!("v17".parse::<Version>().unwrap(), v);
    assert_eq!("17".parse::<Version>().unwrap(), v);
    assert!("v-1".parse::<Version>().is_err());
}

#[test]
fn version_next_saturates() {
    assert_eq!(Version::new(u64::MAX).next(), Version::new(u64::MAX));
}
