//! Concurrent-modification detection and resolution.
//!
//! A pushed snapshot is first classified against what this client already
//! knows ([`classify`]). When it collides with unacknowledged local edits a
//! [`ConflictRecord`] is raised and handed to [`resolve`], which dispatches
//! on the configured [`ConflictStrategy`]. [`ConflictMonitor`] holds the
//! per-entity `clean -> conflicted -> resolving -> clean` state and parks
//! snapshots that arrive while a resolution is under way.

use casesync_types::{ConflictRecord, FieldValue, Fields, Snapshot, Version};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Per-field merge function: `(field, local, remote) -> merged`.
/// Returning `None` drops the field from the merged result.
pub type MergeFn =
    Arc<dyn Fn(&str, Option<&FieldValue>, Option<&FieldValue>) -> Option<FieldValue> + Send + Sync>;

/// Boxes a closure as a [`MergeFn`].
pub fn merge_fn<F>(f: F) -> MergeFn
where
    F: Fn(&str, Option<&FieldValue>, Option<&FieldValue>) -> Option<FieldValue>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

/// How a conflict is settled.
#[derive(Clone, Default)]
pub enum ConflictStrategy {
    /// Keep local edits, ignore the remote snapshot.
    Local,
    /// Drop queued local edits and adopt the remote snapshot.
    Remote,
    /// Merge field by field with a caller-supplied function.
    Merge(MergeFn),
    /// Ask the user; draining pauses until `resolve_conflict` is called.
    #[default]
    Manual,
}

impl ConflictStrategy {
    /// Builds a `Merge` strategy from a closure.
    pub fn merge<F>(f: F) -> Self
    where
        F: Fn(&str, Option<&FieldValue>, Option<&FieldValue>) -> Option<FieldValue>
            + Send
            + Sync
            + 'static,
    {
        ConflictStrategy::Merge(merge_fn(f))
    }

    /// Short name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ConflictStrategy::Local => "local",
            ConflictStrategy::Remote => "remote",
            ConflictStrategy::Merge(_) => "merge",
            ConflictStrategy::Manual => "manual",
        }
    }
}

impl fmt::Debug for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The user's answer to a manual conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualChoice {
    /// Same as the `local` strategy.
    KeepLocal,
    /// Same as the `remote` strategy.
    TakeRemote,
}

/// Conflict-handling state of one entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictState {
    #[default]
    Clean,
    Conflicted,
    Resolving,
}

/// What to do with a pushed snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotVerdict {
    /// Not newer than what this client knows; ignore.
    Stale,
    /// Newer, and nothing local is unacknowledged: adopt as baseline.
    Adopt,
    /// Newer, but every change it carries is the in-flight write landing:
    /// adopt as baseline without touching local edits.
    Echo,
    /// Newer and colliding with unacknowledged local edits.
    Conflict,
}

/// Classifies a pushed snapshot.
///
/// `known` is the newest version this client produced or accepted,
/// `server` the last server state this client saw (which differs from the
/// local baseline after a merge), `in_flight` the fields of the write
/// awaiting a response, and `other_pending` whether anything besides that
/// write is unacknowledged (queued patches or edits still in the debouncer).
///
/// A snapshot is an echo of the in-flight write only when it carries every
/// sent value and every field it changes relative to `server` is one of the
/// sent fields.
pub fn classify(
    snapshot: &Snapshot,
    known: Version,
    server: &Fields,
    in_flight: Option<&Fields>,
    other_pending: bool,
) -> SnapshotVerdict {
    if !snapshot.version.is_newer_than(&known) {
        return SnapshotVerdict::Stale;
    }
    match in_flight {
        None if !other_pending => SnapshotVerdict::Adopt,
        None => SnapshotVerdict::Conflict,
        Some(sent) if is_echo_of(snapshot, server, sent) => SnapshotVerdict::Echo,
        Some(_) => SnapshotVerdict::Conflict,
    }
}

fn is_echo_of(snapshot: &Snapshot, server: &Fields, sent: &Fields) -> bool {
    sent.iter()
        .all(|(name, value)| snapshot.fields.get(name) == Some(value))
        && snapshot
            .changed_fields(server)
            .into_iter()
            .all(|name| sent.contains_key(name))
}

/// Outcome of dispatching a conflict through a strategy.
#[derive(Clone)]
pub enum Resolution {
    /// Keep local edits; the remote snapshot is overridden.
    KeepLocal,
    /// Adopt the remote snapshot; queued local edits are dropped.
    TakeRemote,
    /// Adopt `baseline` at the remote version and rebase queued edits with
    /// `merge`.
    Merged { baseline: Fields, merge: MergeFn },
    /// Wait for the user.
    AwaitUser,
}

impl fmt::Debug for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::KeepLocal => f.write_str("KeepLocal"),
            Resolution::TakeRemote => f.write_str("TakeRemote"),
            Resolution::Merged { baseline, .. } => {
                f.debug_struct("Merged").field("baseline", baseline).finish()
            }
            Resolution::AwaitUser => f.write_str("AwaitUser"),
        }
    }
}

/// Dispatches a conflict through a strategy.
pub fn resolve(strategy: &ConflictStrategy, record: &ConflictRecord) -> Resolution {
    match strategy {
        ConflictStrategy::Local => Resolution::KeepLocal,
        ConflictStrategy::Remote => Resolution::TakeRemote,
        ConflictStrategy::Merge(merge) => Resolution::Merged {
            baseline: merge_fields(&record.local, &record.remote.fields, merge),
            merge: Arc::clone(merge),
        },
        ConflictStrategy::Manual => Resolution::AwaitUser,
    }
}

/// Maps a manual choice onto the equivalent automatic resolution.
pub fn resolve_manual(choice: ManualChoice) -> Resolution {
    match choice {
        ManualChoice::KeepLocal => Resolution::KeepLocal,
        ManualChoice::TakeRemote => Resolution::TakeRemote,
    }
}

/// Merges two field maps over the union of their keys.
pub fn merge_fields(local: &Fields, remote: &Fields, merge: &MergeFn) -> Fields {
    let mut names: Vec<&String> = local.keys().chain(remote.keys()).collect();
    names.sort_unstable();
    names.dedup();
    names
        .into_iter()
        .filter_map(|name| {
            let name = name.as_str();
            merge(name, local.get(name), remote.get(name)).map(|value| (name.to_string(), value))
        })
        .collect()
}

/// Re-resolves each locally edited field against the remote value. Fields
/// the merge drops are removed from the patch.
pub fn rebase_fields(fields: &mut Fields, remote: &Fields, merge: &MergeFn) {
    let rebased: Fields = fields
        .iter()
        .filter_map(|(name, value)| {
            merge(name.as_str(), Some(value), remote.get(name))
                .map(|merged| (name.clone(), merged))
        })
        .collect();
    *fields = rebased;
}

/// Per-entity conflict state.
#[derive(Debug, Default)]
pub struct ConflictMonitor {
    state: ConflictState,
    record: Option<ConflictRecord>,
    parked: Option<Snapshot>,
}

impl ConflictMonitor {
    /// Creates a clean monitor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> ConflictState {
        self.state
    }

    /// The open conflict, if any.
    pub fn record(&self) -> Option<&ConflictRecord> {
        self.record.as_ref()
    }

    /// Whether incoming snapshots must wait.
    pub fn is_busy(&self) -> bool {
        self.state != ConflictState::Clean
    }

    /// Enters `conflicted` with a new record.
    pub fn raise(&mut self, record: ConflictRecord) {
        self.state = ConflictState::Conflicted;
        self.record = Some(record);
    }

    /// Enters `resolving`. Returns the record being resolved.
    pub fn begin_resolving(&mut self) -> Option<ConflictRecord> {
        if self.state != ConflictState::Conflicted {
            return None;
        }
        self.state = ConflictState::Resolving;
        self.record.clone()
    }

    /// Returns to `clean`, handing back a snapshot parked meanwhile.
    pub fn finish(&mut self) -> Option<Snapshot> {
        self.state = ConflictState::Clean;
        self.record = None;
        self.parked.take()
    }

    /// Holds a snapshot until the current resolution finishes. Only the
    /// newest parked snapshot is kept.
    pub fn park(&mut self, snapshot: Snapshot) {
        match &self.parked {
            Some(existing) if existing.version >= snapshot.version => {}
            _ => self.parked = Some(snapshot),
        }
    }
}

/// Ready-made merge functions.
pub mod merge {
    use super::*;
    use std::collections::HashMap;

    /// Which side wins a field.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Side {
        Local,
        Remote,
    }

    /// Local value wins whenever there is one.
    pub fn prefer_local() -> MergeFn {
        merge_fn(|_, local, remote| local.or(remote).cloned())
    }

    /// Remote value wins whenever there is one.
    pub fn prefer_remote() -> MergeFn {
        merge_fn(|_, local, remote| remote.or(local).cloned())
    }

    /// Per-field priority. Fields not listed prefer the local value; a side
    /// with no value for the field yields to the other.
    pub fn prefer_fields(priorities: HashMap<String, Side>) -> MergeFn {
        merge_fn(move |name, local, remote| match priorities.get(name) {
            Some(Side::Remote) => remote.or(local).cloned(),
            _ => local.or(remote).cloned(),
        })
    }

    /// Keyed union for list fields (photo slots, attachments).
    ///
    /// When both sides hold arrays, local items come first in their own
    /// order and a remote item is appended only if no item already taken
    /// shares its `key_field` value. Items without the key are matched on
    /// their whole value. Any other field prefers the local value.
    pub fn union_arrays(key_field: impl Into<String>) -> MergeFn {
        let key_field = key_field.into();
        merge_fn(move |_, local, remote| match (local, remote) {
            (Some(FieldValue::Array(local)), Some(FieldValue::Array(remote))) => {
                let mut merged = local.clone();
                for item in remote {
                    let key = item.get(&key_field);
                    let seen = merged.iter().any(|taken| match key {
                        Some(key) => taken.get(&key_field) == Some(key),
                        None => taken == item,
                    });
                    if !seen {
                        merged.push(item.clone());
                    }
                }
                Some(FieldValue::Array(merged))
            }
            _ => local.or(remote).cloned(),
        })
    }
}
