//! The world facade.
//!
//! A [`World`] bundles the table manager, component store, entity registry,
//! relationships and archetypes behind one `Arc`-shareable handle. Locks are
//! always taken in the order registry → relationships → archetypes.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use engine_component::{ComponentQuery, ComponentType, EntityId};
use engine_entity::{
    Archetype, ArchetypeResolver, CascadeReport, CreateOptions, Edge, EntityChanges,
    EntityError, EntityRecord, EntityRegistry, EntityStatus, Group, RegistryConfig,
    RegistryStats, Relationships, SpawnOptions,
};
use engine_storage::{
    Backup, ComponentStore, PerformanceReport, RestoreReport, RowKey, TableKind, TableManager,
    TableOptions, TableStats,
};
use engine_system::SystemContext;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::WorldError;

/// Table holding registry records at backup time.
pub const ENTITY_TABLE: &str = "entity_registry";
/// Table holding typed edges at backup time.
pub const EDGE_TABLE: &str = "entity_edges";
/// Table holding groups at backup time.
pub const GROUP_TABLE: &str = "entity_groups";
/// Table holding archetypes at backup time.
pub const ARCHETYPE_TABLE: &str = "archetypes";

const SNAPSHOT_TABLES: [&str; 4] = [ENTITY_TABLE, EDGE_TABLE, GROUP_TABLE, ARCHETYPE_TABLE];
const WORLD_OWNER: &str = "world";

/// Point-in-time statistics for the whole world.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorldStats {
    pub entities: RegistryStats,
    pub tables: Vec<TableStats>,
    pub performance: PerformanceReport,
}

/// Shared handle to all entity and component state.
#[derive(Debug)]
pub struct World {
    tables: Arc<TableManager>,
    store: Arc<ComponentStore>,
    registry: Arc<RwLock<EntityRegistry>>,
    relationships: Arc<RwLock<Relationships>>,
    archetypes: RwLock<ArchetypeResolver>,
}

impl Default for World {
    fn default() -> Self {
        Self::new("world", RegistryConfig::default())
    }
}

fn to_rows<T: Serialize>(
    items: impl IntoIterator<Item = (RowKey, T)>,
) -> Result<Vec<(RowKey, Value)>, WorldError> {
    items
        .into_iter()
        .map(|(key, item)| Ok((key, serde_json::to_value(item)?)))
        .collect()
}

fn from_rows<T: DeserializeOwned>(backup: &Backup, table: &str) -> Result<Vec<T>, WorldError> {
    backup
        .table(table)
        .map(|t| {
            t.data
                .iter()
                .map(|(_, value)| serde_json::from_value(value.clone()))
                .collect::<Result<Vec<T>, _>>()
        })
        .transpose()
        .map(Option::unwrap_or_default)
        .map_err(WorldError::from)
}

impl World {
    #[must_use]
    pub fn new(name: impl Into<String>, config: RegistryConfig) -> Self {
        let tables = Arc::new(TableManager::new(name));
        Self {
            store: Arc::new(ComponentStore::new(Arc::clone(&tables))),
            tables,
            registry: Arc::new(RwLock::new(EntityRegistry::new(config))),
            relationships: Arc::new(RwLock::new(Relationships::new())),
            archetypes: RwLock::new(ArchetypeResolver::new()),
        }
    }

    #[must_use]
    pub fn tables(&self) -> &Arc<TableManager> {
        &self.tables
    }

    #[must_use]
    pub fn store(&self) -> &Arc<ComponentStore> {
        &self.store
    }

    #[must_use]
    pub fn registry(&self) -> &RwLock<EntityRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn relationships(&self) -> &RwLock<Relationships> {
        &self.relationships
    }

    #[must_use]
    pub fn archetypes(&self) -> &RwLock<ArchetypeResolver> {
        &self.archetypes
    }

    /// A system context attached to this world's entities.
    #[must_use]
    pub fn context(&self, tick_id: u64, dt: f64) -> SystemContext {
        SystemContext::new(tick_id, dt, Arc::clone(&self.store))
            .with_entities(Arc::clone(&self.registry), Arc::clone(&self.relationships))
    }

    /// Run `f` with write access to both the registry and the relationships.
    pub fn relate<T>(&self, f: impl FnOnce(&mut EntityRegistry, &mut Relationships) -> T) -> T {
        let mut registry = self.registry.write();
        let mut relationships = self.relationships.write();
        f(&mut registry, &mut relationships)
    }

    /// # Errors
    ///
    /// Returns [`WorldError::Storage`] if the type is already registered.
    pub fn register_component(&self, ty: ComponentType) -> Result<(), WorldError> {
        self.store.register(ty)?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`WorldError::Entity`] for duplicates or a bad parent.
    pub fn register_archetype(&self, archetype: Archetype) -> Result<(), WorldError> {
        self.archetypes.write().register(archetype)?;
        Ok(())
    }

    /// Create an entity. A named archetype's default components are
    /// materialized onto it.
    ///
    /// # Errors
    ///
    /// Returns an error if the archetype is unknown or its defaults fail
    /// validation; nothing is created in that case.
    pub fn create(&self, options: CreateOptions) -> Result<EntityId, WorldError> {
        let components = match &options.archetype {
            Some(name) => {
                self.archetypes
                    .read()
                    .materialize(name, &SpawnOptions::new())?
                    .components
            }
            None => BTreeMap::new(),
        };
        self.create_with(options, components)
    }

    /// Spawn an entity from `archetype`, applying `options`.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown archetypes or variations, excluded
    /// required components, or component data that fails validation.
    /// Nothing is created on error.
    pub fn spawn(&self, archetype: &str, options: SpawnOptions) -> Result<EntityId, WorldError> {
        let materialized = self.archetypes.read().materialize(archetype, &options)?;
        let create = CreateOptions {
            archetype: Some(materialized.archetype),
            tags: materialized.tags,
            metadata: materialized.metadata,
        };
        self.create_with(create, materialized.components)
    }

    fn create_with(
        &self,
        options: CreateOptions,
        components: BTreeMap<String, Value>,
    ) -> Result<EntityId, WorldError> {
        for (component, data) in &components {
            self.store.validate(component, data)?;
        }
        let id = self.registry.write().create(options);
        for (component, data) in components {
            if let Err(err) = self.store.put(id, &component, data) {
                self.store.remove_entity(id);
                if let Err(cleanup) = self.relate(|reg, rel| rel.destroy_entity(reg, id)) {
                    warn!(entity = %id, error = %cleanup, "failed to roll back spawn");
                }
                return Err(err.into());
            }
        }
        Ok(id)
    }

    /// Store a component value, bumping the entity's version.
    ///
    /// The registry write lock is held across the store write, so a reader
    /// never sees the new data under the old version.
    ///
    /// # Errors
    ///
    /// Returns [`WorldError::Entity`] for destroyed entities and
    /// [`WorldError::Storage`] if the data fails validation.
    pub fn put_component(
        &self,
        id: EntityId,
        component: &str,
        data: Value,
    ) -> Result<(), WorldError> {
        self.registry
            .write()
            .component_write(id, || self.store.put(id, component, data))
    }

    /// Merge `patch` into a stored component, bumping the entity's version.
    /// Returns the merged value.
    ///
    /// # Errors
    ///
    /// As [`put_component`](Self::put_component), plus
    /// [`WorldError::Storage`] if the component is missing.
    pub fn update_component(
        &self,
        id: EntityId,
        component: &str,
        patch: Value,
    ) -> Result<Value, WorldError> {
        self.registry
            .write()
            .component_write(id, || self.store.update(id, component, patch))
    }

    /// Remove a component, bumping the entity's version. Returns the removed
    /// value.
    ///
    /// # Errors
    ///
    /// As [`update_component`](Self::update_component).
    pub fn remove_component(&self, id: EntityId, component: &str) -> Result<Value, WorldError> {
        self.registry
            .write()
            .component_write(id, || self.store.remove(id, component))
    }

    /// Apply `changes` to an entity's record.
    ///
    /// A status change to `destroyed` applies the remaining changes and then
    /// destroys the entity with relationship cascade, returning the cascade
    /// report. Other changes go straight to [`EntityRegistry::update`].
    ///
    /// # Errors
    ///
    /// Returns [`WorldError::Entity`] for unknown or destroyed entities and
    /// disallowed status changes; nothing changes in that case.
    pub fn update_entity(
        &self,
        id: EntityId,
        mut changes: EntityChanges,
    ) -> Result<Option<CascadeReport>, WorldError> {
        if changes.status != Some(EntityStatus::Destroyed) {
            self.registry.write().update(id, changes)?;
            return Ok(None);
        }
        changes.status = None;
        let report = self.relate(|reg, rel| {
            let record = reg.get(id)?;
            if record.is_destroyed() {
                return Err(EntityError::InvalidStatus {
                    entity: id,
                    status: record.status,
                    operation: "destroy",
                });
            }
            if !changes.is_empty() {
                reg.update(id, changes)?;
            }
            rel.destroy_entity(reg, id)
        })?;
        Ok(Some(report))
    }

    /// Destroy an entity with relationship cascade. Components stay until
    /// garbage collection.
    ///
    /// # Errors
    ///
    /// Returns an error if the entity is unknown or already destroyed.
    pub fn destroy(&self, id: EntityId) -> Result<CascadeReport, WorldError> {
        Ok(self.relate(|reg, rel| rel.destroy_entity(reg, id))?)
    }

    /// Collect expired destroyed entities and their components.
    pub fn collect_garbage(&self) -> Vec<EntityId> {
        self.collect_garbage_at(Utc::now())
    }

    /// [`collect_garbage`](Self::collect_garbage) against an explicit clock.
    pub fn collect_garbage_at(&self, now: DateTime<Utc>) -> Vec<EntityId> {
        let collected = self.registry.write().collect_garbage_at(now);
        for id in &collected {
            self.store.remove_entity(*id);
        }
        collected
    }

    /// Entities a system with `query` should run over: component matches
    /// that are either unknown to the registry or active in it.
    ///
    /// # Errors
    ///
    /// Returns [`WorldError::Storage`] if the query names an unregistered
    /// type.
    pub fn matching_entities(&self, query: &ComponentQuery) -> Result<Vec<EntityId>, WorldError> {
        let candidates = self.store.query(query)?;
        let registry = self.registry.read();
        Ok(candidates
            .into_iter()
            .filter(|id| {
                registry
                    .get(*id)
                    .map_or(true, |r| r.status == EntityStatus::Active)
            })
            .collect())
    }

    fn write_snapshot_table(
        &self,
        name: &str,
        kind: TableKind,
        rows: Vec<(RowKey, Value)>,
    ) -> Result<(), WorldError> {
        let table = match self.tables.table(name) {
            Ok(table) => table,
            Err(_) => self.tables.create_table(
                name,
                TableOptions::default()
                    .with_kind(kind)
                    .with_owner(WORLD_OWNER),
            )?,
        };
        table.clear();
        for (key, value) in rows {
            table.insert(key, value);
        }
        Ok(())
    }

    /// Snapshot registry, relationships and archetypes into their tables.
    fn write_snapshot(&self) -> Result<(), WorldError> {
        let registry = self.registry.read();
        let relationships = self.relationships.read();
        let archetypes = self.archetypes.read();

        let records = to_rows(
            registry
                .records()
                .into_iter()
                .map(|r| (RowKey::Entity(r.id), r)),
        )?;
        let edges = to_rows(
            relationships
                .edges()
                .enumerate()
                .map(|(n, e)| (RowKey::Name(format!("{n:010}")), e)),
        )?;
        let groups = to_rows(
            relationships
                .groups()
                .map(|g| (RowKey::Name(g.id.clone()), g)),
        )?;
        let archetype_rows = to_rows(
            archetypes
                .archetypes()
                .map(|a| (RowKey::Name(a.name.clone()), a)),
        )?;

        self.write_snapshot_table(ENTITY_TABLE, TableKind::OrderedSet, records)?;
        self.write_snapshot_table(EDGE_TABLE, TableKind::OrderedSet, edges)?;
        self.write_snapshot_table(GROUP_TABLE, TableKind::OrderedSet, groups)?;
        self.write_snapshot_table(ARCHETYPE_TABLE, TableKind::OrderedSet, archetype_rows)?;
        Ok(())
    }

    /// Back up every persistent table, registry and relationships included.
    ///
    /// # Errors
    ///
    /// Returns [`WorldError::Snapshot`] if a record cannot be serialised.
    pub fn backup(&self) -> Result<Backup, WorldError> {
        self.write_snapshot()?;
        Ok(self.tables.backup())
    }

    /// Back up every table, non-persistent ones included.
    ///
    /// # Errors
    ///
    /// Returns [`WorldError::Storage`] if a table is dropped while the
    /// backup is taken.
    pub fn backup_all(&self) -> Result<Backup, WorldError> {
        self.write_snapshot()?;
        let names = self.tables.list_tables();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        Ok(self.tables.backup_tables(&names)?)
    }

    /// Back up the named component tables plus the registry snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`WorldError::Storage`] if a named table is missing.
    pub fn backup_components(&self, components: &[&str]) -> Result<Backup, WorldError> {
        self.write_snapshot()?;
        let mut names: Vec<&str> = components.to_vec();
        names.extend(SNAPSHOT_TABLES);
        Ok(self.tables.backup_tables(&names)?)
    }

    /// Replace state with the contents of `backup`.
    ///
    /// Tables in the backup replace their live counterparts; the registry,
    /// relationships and archetypes are rebuilt when their tables are
    /// present, and every component index is rebuilt.
    ///
    /// # Errors
    ///
    /// Returns [`WorldError::Snapshot`] if snapshot rows cannot be decoded;
    /// live state is untouched in that case.
    pub fn restore(&self, backup: &Backup) -> Result<RestoreReport, WorldError> {
        let records: Vec<EntityRecord> = from_rows(backup, ENTITY_TABLE)?;
        let edges: Vec<Edge> = from_rows(backup, EDGE_TABLE)?;
        let groups: Vec<Group> = from_rows(backup, GROUP_TABLE)?;
        let archetypes: Vec<Archetype> = from_rows(backup, ARCHETYPE_TABLE)?;

        let mut registry = self.registry.write();
        let mut relationships = self.relationships.write();
        let report = self.tables.restore(backup);
        if backup.table(ENTITY_TABLE).is_some() {
            registry.restore(records);
        }
        if backup.table(EDGE_TABLE).is_some() || backup.table(GROUP_TABLE).is_some() {
            relationships.restore(groups, edges);
        }
        if backup.table(ARCHETYPE_TABLE).is_some() {
            self.archetypes.write().restore(archetypes);
        }
        drop(relationships);
        drop(registry);

        self.store.rebuild_all_indexes()?;
        info!(tables = report.tables.len(), rows = report.rows, "restored world");
        Ok(report)
    }

    /// Fold `backup` into live state: rows are upserted, live rows the
    /// backup does not mention are kept.
    ///
    /// # Errors
    ///
    /// Returns [`WorldError::Snapshot`] if snapshot rows cannot be decoded.
    pub fn merge(&self, backup: &Backup) -> Result<RestoreReport, WorldError> {
        let records: Vec<EntityRecord> = from_rows(backup, ENTITY_TABLE)?;
        let edges: Vec<Edge> = from_rows(backup, EDGE_TABLE)?;
        let groups: Vec<Group> = from_rows(backup, GROUP_TABLE)?;
        let archetypes: Vec<Archetype> = from_rows(backup, ARCHETYPE_TABLE)?;

        let mut registry = self.registry.write();
        let mut relationships = self.relationships.write();
        let mut report = RestoreReport::default();
        for saved in &backup.tables {
            if SNAPSHOT_TABLES.contains(&saved.name.as_str()) {
                continue;
            }
            let table = match self.tables.table(&saved.name) {
                Ok(table) => table,
                Err(_) => self
                    .tables
                    .create_table(saved.name.clone(), saved.options.clone())?,
            };
            for (key, value) in &saved.data {
                table.insert(key.clone(), value.clone());
            }
            report.tables.push(saved.name.clone());
            report.rows += saved.data.len();
        }

        let mut merged: BTreeMap<EntityId, EntityRecord> =
            registry.records().into_iter().map(|r| (r.id, r)).collect();
        merged.extend(records.into_iter().map(|r| (r.id, r)));
        registry.restore(merged.into_values().collect());

        let mut all_groups: BTreeMap<String, Group> =
            relationships.groups().map(|g| (g.id.clone(), g.clone())).collect();
        all_groups.extend(groups.into_iter().map(|g| (g.id.clone(), g)));
        let mut all_edges: BTreeMap<(EntityId, EntityId, String), Edge> = relationships
            .edges()
            .map(|e| ((e.from, e.to, e.kind.clone()), e.clone()))
            .collect();
        all_edges.extend(edges.into_iter().map(|e| ((e.from, e.to, e.kind.clone()), e)));
        relationships.restore(
            all_groups.into_values().collect(),
            all_edges.into_values().collect(),
        );

        let mut resolver = self.archetypes.write();
        let mut all_archetypes: BTreeMap<String, Archetype> = resolver
            .archetypes()
            .map(|a| (a.name.clone(), a.clone()))
            .collect();
        all_archetypes.extend(archetypes.into_iter().map(|a| (a.name.clone(), a)));
        resolver.restore(all_archetypes.into_values().collect());
        drop(resolver);
        drop(relationships);
        drop(registry);

        self.store.rebuild_all_indexes()?;
        info!(tables = report.tables.len(), rows = report.rows, "merged backup into world");
        Ok(report)
    }

    #[must_use]
    pub fn stats(&self) -> WorldStats {
        WorldStats {
            entities: self.registry.read().stats(),
            tables: self.tables.all_stats(),
            performance: self.store.performance_report(),
        }
    }

    /// Drop every table.
    pub fn shutdown(&self) {
        self.tables.shutdown();
    }
}
