//! The entity registry.
//!
//! Records live in a generational arena: a dense vector of slots, each
//! holding a generation counter and an optional record. An id → slot map
//! gives lookups by id, and an [`EntityHandle`] (slot + generation) gives
//! lookups that detect a reused or reactivated slot without hashing.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use engine_component::{EntityId, EntityIdAllocator, IdStrategy};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::EntityError;
use crate::record::{EntityChanges, EntityRecord, EntityStatus};

/// What happens to the children of a destroyed entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CascadePolicy {
    /// Destroy the whole subtree.
    #[default]
    Destroy,
    /// Detach the children and leave them alive.
    Orphan,
}

/// Registry configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    pub id_strategy: IdStrategy,
    pub cascade: CascadePolicy,
    /// How long a destroyed entity is kept before garbage collection.
    pub gc_retention: Duration,
    /// Page size used when a query does not set a limit.
    pub page_size: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            id_strategy: IdStrategy::Sequential,
            cascade: CascadePolicy::Destroy,
            gc_retention: Duration::from_secs(300),
            page_size: 100,
        }
    }
}

impl RegistryConfig {
    #[must_use]
    pub fn with_id_strategy(mut self, id_strategy: IdStrategy) -> Self {
        self.id_strategy = id_strategy;
        self
    }

    #[must_use]
    pub fn with_cascade(mut self, cascade: CascadePolicy) -> Self {
        self.cascade = cascade;
        self
    }

    #[must_use]
    pub fn with_gc_retention(mut self, gc_retention: Duration) -> Self {
        self.gc_retention = gc_retention;
        self
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

/// A cheap, generation-checked reference to an entity's slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityHandle {
    pub slot: usize,
    /// Generation of the slot, bumped on reuse and on every activation.
    pub generation: u32,
}

/// Options for [`EntityRegistry::create`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateOptions {
    pub archetype: Option<String>,
    pub tags: BTreeSet<String>,
    pub metadata: Map<String, Value>,
}

impl CreateOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_archetype(mut self, archetype: impl Into<String>) -> Self {
        self.archetype = Some(archetype.into());
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Filter for [`EntityRegistry::query`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityFilter {
    pub status: Option<EntityStatus>,
    pub archetype: Option<String>,
    /// Entities must carry every one of these tags.
    pub tags: Vec<String>,
    pub parent: Option<EntityId>,
}

impl EntityFilter {
    #[must_use]
    pub fn with_status(mut self, status: EntityStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_archetype(mut self, archetype: impl Into<String>) -> Self {
        self.archetype = Some(archetype.into());
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    #[must_use]
    pub fn with_parent(mut self, parent: EntityId) -> Self {
        self.parent = Some(parent);
        self
    }
}

/// A window into a sorted result list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    /// Falls back to [`RegistryConfig::page_size`].
    pub limit: Option<usize>,
}

impl Page {
    #[must_use]
    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit: Some(limit),
        }
    }
}

/// One page of query results.
#[derive(Debug, Clone, PartialEq)]
pub struct PageResult {
    pub items: Vec<EntityRecord>,
    /// Number of matches across all pages.
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

impl PageResult {
    #[must_use]
    pub fn has_more(&self) -> bool {
        self.offset + self.items.len() < self.total
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    /// Records currently held, destroyed ones included.
    pub total: usize,
    pub by_status: BTreeMap<EntityStatus, usize>,
    pub created: u64,
    pub destroyed: u64,
    pub collected: u64,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    record: Option<EntityRecord>,
}

/// The canonical store of entity metadata.
#[derive(Debug)]
pub struct EntityRegistry {
    config: RegistryConfig,
    allocator: EntityIdAllocator,
    slots: Vec<Slot>,
    free: Vec<usize>,
    by_id: HashMap<EntityId, usize>,
    by_status: HashMap<EntityStatus, BTreeSet<EntityId>>,
    by_archetype: HashMap<String, BTreeSet<EntityId>>,
    by_tag: HashMap<String, BTreeSet<EntityId>>,
    created: u64,
    destroyed: u64,
    collected: u64,
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

fn index_insert<K: std::hash::Hash + Eq>(
    index: &mut HashMap<K, BTreeSet<EntityId>>,
    key: K,
    id: EntityId,
) {
    index.entry(key).or_default().insert(id);
}

fn index_remove<K, Q>(index: &mut HashMap<K, BTreeSet<EntityId>>, key: &Q, id: EntityId)
where
    K: std::borrow::Borrow<Q> + std::hash::Hash + Eq,
    Q: std::hash::Hash + Eq + ?Sized,
{
    if let Some(ids) = index.get_mut(key) {
        ids.remove(&id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

impl EntityRegistry {
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            allocator: EntityIdAllocator::new(config.id_strategy),
            config,
            slots: Vec::new(),
            free: Vec::new(),
            by_id: HashMap::new(),
            by_status: HashMap::new(),
            by_archetype: HashMap::new(),
            by_tag: HashMap::new(),
            created: 0,
            destroyed: 0,
            collected: 0,
        }
    }

    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn index(&mut self, record: &EntityRecord) {
        index_insert(&mut self.by_status, record.status, record.id);
        if let Some(archetype) = &record.archetype {
            index_insert(&mut self.by_archetype, archetype.clone(), record.id);
        }
        for tag in &record.tags {
            index_insert(&mut self.by_tag, tag.clone(), record.id);
        }
    }

    fn unindex(&mut self, record: &EntityRecord) {
        index_remove(&mut self.by_status, &record.status, record.id);
        if let Some(archetype) = &record.archetype {
            index_remove(&mut self.by_archetype, archetype.as_str(), record.id);
        }
        for tag in &record.tags {
            index_remove(&mut self.by_tag, tag.as_str(), record.id);
        }
    }

    /// Place `record` in a free slot, returning the slot index.
    fn occupy(&mut self, record: EntityRecord) -> usize {
        self.index(&record);
        let id = record.id;
        let slot = match self.free.pop() {
            Some(slot) => {
                let entry = &mut self.slots[slot];
                entry.generation += 1;
                entry.record = Some(record);
                slot
            }
            None => {
                self.slots.push(Slot {
                    generation: 1,
                    record: Some(record),
                });
                self.slots.len() - 1
            }
        };
        self.by_id.insert(id, slot);
        slot
    }

    /// Create a new active entity at version 1 and generation 1.
    pub fn create(&mut self, options: CreateOptions) -> EntityId {
        let id = self.allocator.allocate();
        let mut record = EntityRecord::new(id, Utc::now());
        record.archetype = options.archetype;
        record.tags = options.tags;
        record.metadata = options.metadata;
        self.occupy(record);
        self.created += 1;
        debug!(entity = %id, "created entity");
        id
    }

    fn slot_of(&self, id: EntityId) -> Result<usize, EntityError> {
        self.by_id.get(&id).copied().ok_or(EntityError::NotFound(id))
    }

    /// Look up an entity's record.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::NotFound`] for unknown ids.
    pub fn get(&self, id: EntityId) -> Result<&EntityRecord, EntityError> {
        let slot = self.slot_of(id)?;
        self.slots[slot]
            .record
            .as_ref()
            .ok_or(EntityError::NotFound(id))
    }

    #[must_use]
    pub fn contains(&self, id: EntityId) -> bool {
        self.by_id.contains_key(&id)
    }

    /// `true` if the entity exists and is not destroyed.
    #[must_use]
    pub fn is_alive(&self, id: EntityId) -> bool {
        self.get(id).is_ok_and(|r| !r.is_destroyed())
    }

    /// Returns a handle to the entity's current slot and generation.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::NotFound`] for unknown ids.
    pub fn handle(&self, id: EntityId) -> Result<EntityHandle, EntityError> {
        let slot = self.slot_of(id)?;
        Ok(EntityHandle {
            slot,
            generation: self.slots[slot].generation,
        })
    }

    /// Follow a handle to its record.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::StaleHandle`] if the slot was reused, emptied
    /// or reactivated since the handle was taken.
    pub fn resolve(&self, handle: EntityHandle) -> Result<&EntityRecord, EntityError> {
        self.slots
            .get(handle.slot)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.record.as_ref())
            .ok_or(EntityError::StaleHandle(handle))
    }

    /// Run `f` on a record, keeping the indexes in step with whatever it
    /// changes. `f` must leave the record untouched when it fails.
    fn with_record<T>(
        &mut self,
        id: EntityId,
        f: impl FnOnce(&mut EntityRecord) -> Result<T, EntityError>,
    ) -> Result<T, EntityError> {
        let slot = self.slot_of(id)?;
        let mut record = self.slots[slot]
            .record
            .take()
            .ok_or(EntityError::NotFound(id))?;
        self.unindex(&record);
        let result = f(&mut record);
        self.index(&record);
        self.slots[slot].record = Some(record);
        result
    }

    /// Apply a mutation that cannot fail, bumping the version once.
    pub(crate) fn modify(
        &mut self,
        id: EntityId,
        f: impl FnOnce(&mut EntityRecord),
    ) -> Result<(), EntityError> {
        self.with_record(id, |record| {
            f(record);
            record.bump(Utc::now());
            Ok(())
        })
    }

    /// Record a mutation made outside the record itself, such as a component
    /// write. Returns the new version.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::NotFound`] for unknown ids and
    /// [`EntityError::InvalidStatus`] for destroyed entities.
    pub fn touch(&mut self, id: EntityId) -> Result<u64, EntityError> {
        self.with_record(id, |record| {
            writable(id, record)?;
            record.bump(Utc::now());
            Ok(record.version)
        })
    }

    /// Run `write` against an entity's component data and count it as one
    /// mutation of the entity.
    ///
    /// Destroyed entities are refused before `write` runs and the version is
    /// bumped only when `write` succeeds. Ids the registry has never issued
    /// are written without a version.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::InvalidStatus`] for destroyed entities, or the
    /// error `write` returned.
    pub fn component_write<T, E, W>(
        &mut self,
        id: EntityId,
        write: impl FnOnce() -> Result<T, W>,
    ) -> Result<T, E>
    where
        E: From<EntityError> + From<W>,
    {
        let Some(&slot) = self.by_id.get(&id) else {
            return write().map_err(E::from);
        };
        let Some(record) = self.slots[slot].record.as_mut() else {
            return write().map_err(E::from);
        };
        writable(id, record)?;
        let value = write()?;
        record.bump(Utc::now());
        Ok(value)
    }

    /// Apply `changes` as one mutation.
    ///
    /// Only `active` ↔ `inactive` transitions are allowed here; pooling,
    /// activation and destruction have their own operations. A change to
    /// `destroyed` is rejected because destruction must also cascade over
    /// relationships; `World::update_entity` in `engine_app` forwards it to
    /// the cascading destroy.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::NotFound`] for unknown ids and
    /// [`EntityError::InvalidStatus`] for destroyed entities or disallowed
    /// status changes.
    pub fn update(
        &mut self,
        id: EntityId,
        changes: EntityChanges,
    ) -> Result<&EntityRecord, EntityError> {
        self.with_record(id, |record| {
            let settable = |s: EntityStatus| matches!(s, EntityStatus::Active | EntityStatus::Inactive);
            if record.is_destroyed() {
                return Err(EntityError::InvalidStatus {
                    entity: id,
                    status: record.status,
                    operation: "update",
                });
            }
            if let Some(status) = changes.status
                && (!settable(status) || !settable(record.status))
            {
                return Err(EntityError::InvalidStatus {
                    entity: id,
                    status: record.status,
                    operation: "change status of",
                });
            }

            let now = Utc::now();
            if let Some(status) = changes.status
                && status != record.status
            {
                record.status = status;
                record.log(format!("status:{status}"), now);
            }
            if let Some(archetype) = changes.archetype {
                record.archetype = archetype;
            }
            for tag in changes.remove_tags {
                record.tags.remove(&tag);
            }
            record.tags.extend(changes.add_tags);
            for (key, value) in changes.metadata {
                if value.is_null() {
                    record.metadata.remove(&key);
                } else {
                    record.metadata.insert(key, value);
                }
            }
            record.bump(now);
            Ok(())
        })?;
        self.get(id)
    }

    /// Mark an entity destroyed. Relationship cleanup is done by
    /// [`Relationships::destroy_entity`](crate::Relationships::destroy_entity).
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::NotFound`] for unknown ids and
    /// [`EntityError::InvalidStatus`] if it is already destroyed.
    pub fn destroy(&mut self, id: EntityId) -> Result<(), EntityError> {
        self.with_record(id, |record| {
            if record.is_destroyed() {
                return Err(EntityError::InvalidStatus {
                    entity: id,
                    status: record.status,
                    operation: "destroy",
                });
            }
            let now = Utc::now();
            record.status = EntityStatus::Destroyed;
            record.destroyed_at = Some(now);
            record.log("destroyed", now);
            record.bump(now);
            Ok(())
        })?;
        self.destroyed += 1;
        debug!(entity = %id, "destroyed entity");
        Ok(())
    }

    /// Park an active or inactive entity in the pool.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::InvalidStatus`] from any other status.
    pub fn pool(&mut self, id: EntityId) -> Result<(), EntityError> {
        self.with_record(id, |record| {
            if !matches!(record.status, EntityStatus::Active | EntityStatus::Inactive) {
                return Err(EntityError::InvalidStatus {
                    entity: id,
                    status: record.status,
                    operation: "pool",
                });
            }
            let now = Utc::now();
            record.status = EntityStatus::Pooled;
            record.log("pooled", now);
            record.bump(now);
            Ok(())
        })
    }

    /// Bring a pooled entity back, incrementing its generation.
    ///
    /// Handles taken before activation become stale.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::InvalidStatus`] unless the entity is pooled.
    pub fn activate(&mut self, id: EntityId) -> Result<(), EntityError> {
        self.with_record(id, |record| {
            if record.status != EntityStatus::Pooled {
                return Err(EntityError::InvalidStatus {
                    entity: id,
                    status: record.status,
                    operation: "activate",
                });
            }
            let now = Utc::now();
            record.status = EntityStatus::Active;
            record.generation += 1;
            record.log("activated", now);
            record.bump(now);
            Ok(())
        })?;
        let slot = self.slot_of(id)?;
        self.slots[slot].generation += 1;
        Ok(())
    }

    fn ids_in<K, Q>(index: &HashMap<K, BTreeSet<EntityId>>, key: &Q) -> Vec<EntityId>
    where
        K: std::borrow::Borrow<Q> + std::hash::Hash + Eq,
        Q: std::hash::Hash + Eq + ?Sized,
    {
        index
            .get(key)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Ids with the given status, ascending.
    #[must_use]
    pub fn by_status(&self, status: EntityStatus) -> Vec<EntityId> {
        Self::ids_in(&self.by_status, &status)
    }

    #[must_use]
    pub fn by_archetype(&self, archetype: &str) -> Vec<EntityId> {
        Self::ids_in(&self.by_archetype, archetype)
    }

    #[must_use]
    pub fn by_tag(&self, tag: &str) -> Vec<EntityId> {
        Self::ids_in(&self.by_tag, tag)
    }

    /// Every id, ascending.
    #[must_use]
    pub fn ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.by_id.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Records matching `filter`, sorted by id and paginated.
    #[must_use]
    pub fn query(&self, filter: &EntityFilter, page: Page) -> PageResult {
        let empty = BTreeSet::new();
        let mut candidates: Vec<&BTreeSet<EntityId>> = Vec::new();
        if let Some(status) = filter.status {
            candidates.push(self.by_status.get(&status).unwrap_or(&empty));
        }
        if let Some(archetype) = &filter.archetype {
            candidates.push(self.by_archetype.get(archetype).unwrap_or(&empty));
        }
        for tag in &filter.tags {
            candidates.push(self.by_tag.get(tag).unwrap_or(&empty));
        }
        candidates.sort_by_key(|set| set.len());

        let ids: Vec<EntityId> = match candidates.split_first() {
            Some((first, rest)) => first
                .iter()
                .filter(|id| rest.iter().all(|set| set.contains(*id)))
                .copied()
                .collect(),
            None => self.ids(),
        };
        let matches: Vec<&EntityRecord> = ids
            .into_iter()
            .filter_map(|id| self.get(id).ok())
            .filter(|record| filter.parent.is_none_or(|p| record.parent_id == Some(p)))
            .collect();

        let limit = page.limit.unwrap_or(self.config.page_size);
        PageResult {
            total: matches.len(),
            items: matches
                .into_iter()
                .skip(page.offset)
                .take(limit)
                .cloned()
                .collect(),
            offset: page.offset,
            limit,
        }
    }

    /// Remove entities destroyed longer than the retention window ago.
    ///
    /// Returns the ids removed so their components can be dropped too.
    pub fn collect_garbage(&mut self) -> Vec<EntityId> {
        self.collect_garbage_at(Utc::now())
    }

    /// [`collect_garbage`](Self::collect_garbage) against an explicit clock.
    pub fn collect_garbage_at(&mut self, now: DateTime<Utc>) -> Vec<EntityId> {
        let retention = self.config.gc_retention;
        let expired: Vec<EntityId> = self
            .by_status(EntityStatus::Destroyed)
            .into_iter()
            .filter(|id| {
                self.get(*id)
                    .ok()
                    .and_then(|r| r.destroyed_at)
                    .is_some_and(|at| (now - at).to_std().is_ok_and(|age| age >= retention))
            })
            .collect();

        for id in &expired {
            if let Some(slot) = self.by_id.remove(id)
                && let Some(record) = self.slots[slot].record.take()
            {
                self.unindex(&record);
                self.free.push(slot);
            }
        }
        self.collected += expired.len() as u64;
        if !expired.is_empty() {
            info!(collected = expired.len(), "garbage collected destroyed entities");
        }
        expired
    }

    /// Number of records held, destroyed ones included.
    #[must_use]
    pub fn count(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn count_by_status(&self, status: EntityStatus) -> usize {
        self.by_status.get(&status).map_or(0, BTreeSet::len)
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            total: self.count(),
            by_status: EntityStatus::ALL
                .into_iter()
                .map(|s| (s, self.count_by_status(s)))
                .collect(),
            created: self.created,
            destroyed: self.destroyed,
            collected: self.collected,
        }
    }

    /// Copies of every record, ascending by id.
    #[must_use]
    pub fn records(&self) -> Vec<EntityRecord> {
        self.ids()
            .into_iter()
            .filter_map(|id| self.get(id).ok().cloned())
            .collect()
    }

    /// Replace every record with `records`, as after a restore.
    ///
    /// The id allocator is advanced past every restored id.
    pub fn restore(&mut self, records: Vec<EntityRecord>) {
        self.slots.clear();
        self.free.clear();
        self.by_id.clear();
        self.by_status.clear();
        self.by_archetype.clear();
        self.by_tag.clear();
        let count = records.len();
        for record in records {
            self.allocator.observe(record.id);
            self.occupy(record);
        }
        info!(entities = count, "restored entity registry");
    }
}

fn writable(id: EntityId, record: &EntityRecord) -> Result<(), EntityError> {
    if record.is_destroyed() {
        return Err(EntityError::InvalidStatus {
            entity: id,
            status: record.status,
            operation: "modify components of",
        });
    }
    Ok(())
}
