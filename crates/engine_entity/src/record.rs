//! The per-entity metadata record.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use engine_component::EntityId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle status of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityStatus {
    Active,
    Inactive,
    /// Parked for reuse; brought back with `activate`.
    Pooled,
    /// Soft-deleted. Irreversible.
    Destroyed,
}

impl EntityStatus {
    pub const ALL: [Self; 4] = [Self::Active, Self::Inactive, Self::Pooled, Self::Destroyed];

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Pooled => "pooled",
            Self::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One entry of an entity's lifecycle history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// `created`, `destroyed`, `pooled`, `activated` or `status:<new>`.
    pub label: String,
    pub at: DateTime<Utc>,
}

/// Canonical metadata for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    /// Starts at 1 and grows by exactly 1 on every mutation.
    pub version: u64,
    /// Starts at 1 and grows each time the entity leaves the pool.
    pub generation: u32,
    pub status: EntityStatus,
    pub archetype: Option<String>,
    pub tags: BTreeSet<String>,
    pub parent_id: Option<EntityId>,
    pub children: BTreeSet<EntityId>,
    pub metadata: Map<String, Value>,
    pub lifecycle_events: Vec<LifecycleEvent>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub destroyed_at: Option<DateTime<Utc>>,
}

impl EntityRecord {
    pub(crate) fn new(id: EntityId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            version: 1,
            generation: 1,
            status: EntityStatus::Active,
            archetype: None,
            tags: BTreeSet::new(),
            parent_id: None,
            children: BTreeSet::new(),
            metadata: Map::new(),
            lifecycle_events: vec![LifecycleEvent {
                label: "created".to_string(),
                at: now,
            }],
            created_at: now,
            updated_at: now,
            destroyed_at: None,
        }
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.status == EntityStatus::Destroyed
    }

    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Record one mutation.
    pub(crate) fn bump(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = now;
    }

    pub(crate) fn log(&mut self, label: impl Into<String>, now: DateTime<Utc>) {
        self.lifecycle_events.push(LifecycleEvent {
            label: label.into(),
            at: now,
        });
    }
}

/// A set of changes applied by `EntityRegistry::update` as one mutation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityChanges {
    pub status: Option<EntityStatus>,
    /// `Some(None)` clears the archetype.
    pub archetype: Option<Option<String>>,
    pub add_tags: BTreeSet<String>,
    pub remove_tags: BTreeSet<String>,
    /// Merged into the existing metadata; `null` values delete keys.
    pub metadata: Map<String, Value>,
}

impl EntityChanges {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_status(mut self, status: EntityStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_archetype(mut self, archetype: Option<String>) -> Self {
        self.archetype = Some(archetype);
        self
    }

    #[must_use]
    pub fn add_tag(mut self, tag: impl Into<String>) -> Self {
        self.add_tags.insert(tag.into());
        self
    }

    #[must_use]
    pub fn remove_tag(mut self, tag: impl Into<String>) -> Self {
        self.remove_tags.insert(tag.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.archetype.is_none()
            && self.add_tags.is_empty()
            && self.remove_tags.is_empty()
            && self.metadata.is_empty()
    }
}
