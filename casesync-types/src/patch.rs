//! Field patches and entity snapshots.
//!
//! A record is modelled as a flat map from field name to JSON value. Edits
//! travel as [`FieldPatch`]es (partial updates); authoritative state travels
//! as [`Snapshot`]s.

use crate::{EntityId, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Value of a single field.
pub type FieldValue = serde_json::Value;

/// Field name to value map. Ordered so patches serialize deterministically.
pub type Fields = BTreeMap<String, FieldValue>;

/// Client-assigned sequence number of a patch.
///
/// Monotonic per entity and stable across retries of the same patch, so the
/// persistence backend can deduplicate replays.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Seq(u64);

impl Seq {
    /// First sequence number handed out for an entity.
    pub const FIRST: Seq = Seq(1);

    /// Creates a sequence number from its raw value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn get(&self) -> u64 {
        self.0
    }

    /// Returns the following sequence number.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Partial update of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldPatch {
    /// The entity being updated.
    pub entity_id: EntityId,
    /// Client sequence number.
    pub seq: Seq,
    /// New values, keyed by field name.
    pub fields: Fields,
}

impl FieldPatch {
    /// Creates an empty patch.
    pub fn new(entity_id: EntityId, seq: Seq) -> Self {
        Self {
            entity_id,
            seq,
            fields: Fields::new(),
        }
    }

    /// Adds a field value (builder style).
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Merges `other` into this patch. Fields present in both take the value
    /// from `other`; the field set becomes the union.
    pub fn merge(&mut self, other: &Fields) {
        apply_fields(&mut self.fields, other);
    }

    /// Returns the value of a field, if this patch touches it.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Whether the patch touches no field.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Number of fields touched.
    pub fn len(&self) -> usize {
        self.fields.len()
    }
}

/// Authoritative (or locally assumed) state of an entity at a version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The entity.
    pub entity_id: EntityId,
    /// Server version this state corresponds to.
    pub version: Version,
    /// All known fields.
    pub fields: Fields,
}

impl Snapshot {
    /// Creates a snapshot.
    pub fn new(entity_id: EntityId, version: Version, fields: Fields) -> Self {
        Self {
            entity_id,
            version,
            fields,
        }
    }

    /// Creates a snapshot of an entity with no fields at `Version::ZERO`.
    pub fn empty(entity_id: EntityId) -> Self {
        Self::new(entity_id, Version::ZERO, Fields::new())
    }

    /// Adds a field value (builder style).
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Returns the value of a field.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Names of the fields whose value differs between `self` and `other`,
    /// including fields present on only one side.
    pub fn changed_fields<'a>(&'a self, other: &'a Fields) -> Vec<&'a str> {
        let mut changed: Vec<&str> = self
            .fields
            .iter()
            .filter(|(k, v)| other.get(*k) != Some(*v))
            .map(|(k, _)| k.as_str())
            .collect();
        changed.extend(
            other
                .keys()
                .filter(|k| !self.fields.contains_key(*k))
                .map(String::as_str),
        );
        changed
    }
}

/// Overwrites `base` with every field of `patch`.
pub fn apply_fields(base: &mut Fields, patch: &Fields) {
    for (name, value) in patch {
        base.insert(name.clone(), value.clone());
    }
}
