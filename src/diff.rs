//! Structural diff between two JSON-like values.
//!
//! Values are viewed as one of three shapes: mapping, sequence or scalar.
//! Mappings are compared key by key (in sorted key order, so the output does
//! not depend on insertion order). Sequences are compared as sets of their
//! elements' string forms: duplicates collapse and elements with the same
//! string form are indistinguishable. Scalars are compared for equality.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Path segment marking watchlist entries.
pub const WATCHLIST_MARKER: &str = "watchlist";
/// Path segment marking favourite films.
pub const FAVOURITE_MARKER: &str = "favourite";
/// Path segment marking profile fields.
pub const PROFILE_MARKER: &str = "profile";

/// A value found at a path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathedValue {
    pub path: String,
    pub value: Value,
}

/// A value that differs between the two sides at a path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathedChange {
    pub path: String,
    pub old_value: Value,
    pub new_value: Value,
}

/// Difference between two values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub added: Vec<PathedValue>,
    pub removed: Vec<PathedValue>,
    pub changed: Vec<PathedChange>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.changed.len()
    }

    fn extend(&mut self, other: Delta) {
        self.added.extend(other.added);
        self.removed.extend(other.removed);
        self.changed.extend(other.changed);
    }
}

enum Shape<'a> {
    Mapping(&'a Map<String, Value>),
    Sequence(&'a [Value]),
    Scalar(&'a Value),
}

fn shape(value: &Value) -> Shape<'_> {
    match value {
        Value::Object(map) => Shape::Mapping(map),
        Value::Array(items) => Shape::Sequence(items),
        other => Shape::Scalar(other),
    }
}

fn join_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}

/// String form used for set membership in sequences: strings as-is,
/// everything else as compact JSON.
fn element_repr(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Compute the delta from `old` to `new`, rooted at `path`.
pub fn compute_delta(old: &Value, new: &Value, path: &str) -> Delta {
    match (shape(old), shape(new)) {
        (Shape::Mapping(old), Shape::Mapping(new)) => diff_mappings(old, new, path),
        (Shape::Sequence(old), Shape::Sequence(new)) => diff_sequences(old, new, path),
        _ => {
            let mut delta = Delta::default();
            if old != new {
                delta.changed.push(PathedChange {
                    path: path.to_string(),
                    old_value: old.clone(),
                    new_value: new.clone(),
                });
            }
            delta
        }
    }
}

fn diff_mappings(old: &Map<String, Value>, new: &Map<String, Value>, path: &str) -> Delta {
    let mut delta = Delta::default();
    let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();

    for key in keys {
        let key_path = join_path(path, key);
        match (old.get(key), new.get(key)) {
            (None, Some(value)) => delta.added.push(PathedValue {
                path: key_path,
                value: value.clone(),
            }),
            (Some(value), None) => delta.removed.push(PathedValue {
                path: key_path,
                value: value.clone(),
            }),
            (Some(old_value), Some(new_value)) if old_value != new_value => {
                delta.extend(compute_delta(old_value, new_value, &key_path));
            }
            _ => {}
        }
    }

    delta
}

fn diff_sequences(old: &[Value], new: &[Value], path: &str) -> Delta {
    let old_set: BTreeSet<String> = old.iter().map(element_repr).collect();
    let new_set: BTreeSet<String> = new.iter().map(element_repr).collect();

    Delta {
        added: at_path(path, new_set.difference(&old_set)),
        removed: at_path(path, old_set.difference(&new_set)),
        changed: Vec::new(),
    }
}

fn at_path<'a>(path: &str, items: impl Iterator<Item = &'a String>) -> Vec<PathedValue> {
    items
        .map(|item| PathedValue {
            path: path.to_string(),
            value: Value::String(item.clone()),
        })
        .collect()
}

/// Whether an entry was added or removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Removed,
}

/// A membership change (added or removed entry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembershipChange {
    pub kind: ChangeKind,
    pub path: String,
    pub value: Value,
}

/// Profile delta partitioned into human-meaningful buckets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileChanges {
    pub has_changes: bool,
    pub total_changes: usize,
    pub delta: Delta,
    pub watchlist_changes: Vec<MembershipChange>,
    pub favourite_changes: Vec<MembershipChange>,
    pub profile_changes: Vec<PathedChange>,
}

/// Diff two profile captures and sort the result into watchlist, favourite
/// and profile-field buckets. The buckets are views over the delta; entries
/// that match no marker only appear in `delta`.
pub fn detect_profile_changes(old: &Value, new: &Value) -> ProfileChanges {
    let delta = compute_delta(old, new, "");

    let memberships: Vec<MembershipChange> = delta
        .added
        .iter()
        .map(|e| (ChangeKind::Added, e))
        .chain(delta.removed.iter().map(|e| (ChangeKind::Removed, e)))
        .map(|(kind, entry)| MembershipChange {
            kind,
            path: entry.path.clone(),
            value: entry.value.clone(),
        })
        .collect();

    let in_bucket = |marker: &str| -> Vec<MembershipChange> {
        memberships
            .iter()
            .filter(|c| c.path.contains(marker))
            .cloned()
            .collect()
    };

    ProfileChanges {
        has_changes: !delta.is_empty(),
        total_changes: delta.len(),
        watchlist_changes: in_bucket(WATCHLIST_MARKER),
        favourite_changes: in_bucket(FAVOURITE_MARKER),
        profile_changes: delta
            .changed
            .iter()
            .filter(|c| c.path.contains(PROFILE_MARKER))
            .cloned()
            .collect(),
        delta,
    }
}
