//! Secondary indexes over component fields.
//!
//! A [`FieldIndex`] maps a field value to the set of entities whose component
//! currently holds that value. JSON values are not hashable, so each value is
//! keyed by its canonical JSON encoding ([`IndexKey`]).

use std::collections::{HashMap, HashSet};

use engine_component::EntityId;
use serde_json::Value;

/// Canonical, hashable form of a field value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexKey(String);

impl IndexKey {
    /// Build the key for `value`.
    ///
    /// Object keys are kept sorted by `serde_json`, so equal values always
    /// produce the same key.
    #[must_use]
    pub fn of(value: &Value) -> Self {
        Self(value.to_string())
    }

    /// Build the key for `field` of a component value, if the field is set.
    #[must_use]
    pub fn of_field(data: &Value, field: &str) -> Option<Self> {
        data.get(field).map(Self::of)
    }
}

/// Index for a single field of a single component type.
#[derive(Debug, Default)]
pub struct FieldIndex {
    entries: HashMap<IndexKey, HashSet<EntityId>>,
}

impl FieldIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: IndexKey, entity: EntityId) {
        self.entries.entry(key).or_default().insert(entity);
    }

    /// Remove `entity` under `key`, dropping the bucket once empty.
    pub fn remove(&mut self, key: &IndexKey, entity: EntityId) {
        if let Some(bucket) = self.entries.get_mut(key) {
            bucket.remove(&entity);
            if bucket.is_empty() {
                self.entries.remove(key);
            }
        }
    }

    /// Entities indexed under `key`.
    #[must_use]
    pub fn get(&self, key: &IndexKey) -> HashSet<EntityId> {
        self.entries.get(key).cloned().unwrap_or_default()
    }

    /// Number of distinct values indexed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of (value, entity) entries.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.values().map(HashSet::len).sum()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Keep only entries for which `keep` returns `true`.
    ///
    /// Returns the number of entries removed.
    pub fn retain(&mut self, mut keep: impl FnMut(&IndexKey, EntityId) -> bool) -> usize {
        let mut removed = 0;
        self.entries.retain(|key, bucket| {
            let before = bucket.len();
            bucket.retain(|entity| keep(key, *entity));
            removed += before - bucket.len();
            !bucket.is_empty()
        });
        removed
    }
}
