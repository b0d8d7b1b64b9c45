//! Schema-validated component storage.
//!
//! [`ComponentStore`] sits on top of a [`TableManager`]: every registered
//! component type gets one table keyed by entity, plus a secondary index for
//! each of its indexed fields. Writes validate first and update the row and
//! its index entries under the type's index lock, so a reader of either
//! never observes a half-applied write.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use engine_component::{ComponentDescriptor, ComponentQuery, ComponentType, EntityId};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::index::{FieldIndex, IndexKey};
use crate::stats::{ComponentCounters, ComponentStats, OptimizeReport, PerformanceReport};
use crate::table::{RowKey, Table, TableManager, TableOptions};

const STORE_OWNER: &str = "component_store";

struct ComponentColumn {
    ty: ComponentType,
    indexes: RwLock<HashMap<String, FieldIndex>>,
    counters: ComponentCounters,
}

impl ComponentColumn {
    fn new(ty: ComponentType) -> Self {
        let indexes = ty
            .indexed_fields()
            .iter()
            .map(|field| (field.clone(), FieldIndex::new()))
            .collect();
        Self {
            ty,
            indexes: RwLock::new(indexes),
            counters: ComponentCounters::default(),
        }
    }
}

/// Move `entity`'s index entries from `old` to `new`.
fn reindex(
    indexes: &mut HashMap<String, FieldIndex>,
    entity: EntityId,
    old: Option<&Value>,
    new: Option<&Value>,
) {
    for (field, index) in indexes.iter_mut() {
        if let Some(key) = old.and_then(|v| IndexKey::of_field(v, field)) {
            index.remove(&key, entity);
        }
        if let Some(key) = new.and_then(|v| IndexKey::of_field(v, field)) {
            index.insert(key, entity);
        }
    }
}

/// Shallow merge: top-level keys of `patch` replace those of `current`.
fn merge_patch(current: &Value, patch: Value) -> Value {
    match (current, patch) {
        (Value::Object(base), Value::Object(changes)) => {
            let mut merged = base.clone();
            for (key, value) in changes {
                merged.insert(key, value);
            }
            Value::Object(merged)
        }
        (_, patch) => patch,
    }
}

/// Typed component reads and writes over a [`TableManager`].
pub struct ComponentStore {
    tables: Arc<TableManager>,
    columns: DashMap<String, Arc<ComponentColumn>>,
}

impl ComponentStore {
    #[must_use]
    pub fn new(tables: Arc<TableManager>) -> Self {
        Self {
            tables,
            columns: DashMap::new(),
        }
    }

    /// The table manager backing this store.
    #[must_use]
    pub fn tables(&self) -> &Arc<TableManager> {
        &self.tables
    }

    /// Register a component type and create its table.
    ///
    /// If a table of the same name already exists (for example after a
    /// restore) it is adopted and its indexes are rebuilt from its rows.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::DuplicateComponent`] if the type is already
    /// registered, or [`StorageError::Descriptor`] if its descriptor cannot
    /// be stored as table metadata. Nothing is created on error.
    pub fn register(&self, ty: ComponentType) -> Result<(), StorageError> {
        let name = ty.name().to_string();
        if self.columns.contains_key(&name) {
            return Err(StorageError::DuplicateComponent(name));
        }
        let descriptor = serde_json::to_value(ty.descriptor())?;

        let table = match self.tables.table(&name) {
            Ok(table) => table,
            Err(_) => self.tables.create_table(
                name.clone(),
                TableOptions::default()
                    .with_owner(STORE_OWNER)
                    .with_persistent(ty.is_persistent()),
            )?,
        };
        table.set_metadata(descriptor);

        let column = Arc::new(ComponentColumn::new(ty));
        self.columns.insert(name.clone(), Arc::clone(&column));
        Self::rebuild_column(&column, &table);

        info!(
            component = %name,
            indexed = column.ty.indexed_fields().len(),
            rows = table.len(),
            "registered component type"
        );
        Ok(())
    }

    /// Descriptors of every registered component type, ordered by name.
    #[must_use]
    pub fn component_types(&self) -> Vec<ComponentDescriptor> {
        let mut types: Vec<ComponentDescriptor> = self
            .columns
            .iter()
            .map(|c| c.ty.descriptor().clone())
            .collect();
        types.sort_by(|a, b| a.name.cmp(&b.name));
        types
    }

    /// The registered type named `name`, validator included.
    #[must_use]
    pub fn component_type(&self, name: &str) -> Option<ComponentType> {
        self.columns.get(name).map(|c| c.ty.clone())
    }

    /// `true` once [`ComponentStore::register`] has accepted a type named
    /// `name`.
    #[must_use]
    pub fn is_registered(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    fn column(&self, component: &str) -> Result<Arc<ComponentColumn>, StorageError> {
        self.columns
            .get(component)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| StorageError::TableMissing(component.to_string()))
    }

    fn column_and_table(
        &self,
        component: &str,
    ) -> Result<(Arc<ComponentColumn>, Arc<Table>), StorageError> {
        let column = self.column(component)?;
        let table = self.tables.table(component)?;
        Ok((column, table))
    }

    /// Check `data` against the type's validator without writing anything.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ValidationFailed`] on rejection or
    /// [`StorageError::TableMissing`] for an unregistered type.
    pub fn validate(&self, component: &str, data: &Value) -> Result<(), StorageError> {
        let column = self.column(component)?;
        column.ty.validate(data)?;
        Ok(())
    }

    fn reject(
        column: &ComponentColumn,
        entity: EntityId,
        started: Instant,
        err: engine_component::SchemaError,
    ) -> StorageError {
        column.counters.record_rejection();
        column.counters.record_write(started.elapsed());
        debug!(component = %column.ty.name(), %entity, error = %err, "rejected component write");
        StorageError::ValidationFailed(err)
    }

    /// Insert or replace `entity`'s instance of `component`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ValidationFailed`] if the data is rejected, in
    /// which case neither the table nor the indexes change.
    pub fn put(&self, entity: EntityId, component: &str, data: Value) -> Result<(), StorageError> {
        let started = Instant::now();
        let (column, table) = self.column_and_table(component)?;
        if let Err(err) = column.ty.validate(&data) {
            return Err(Self::reject(&column, entity, started, err));
        }

        let mut indexes = column.indexes.write();
        let old = table.insert(RowKey::Entity(entity), data.clone());
        reindex(&mut indexes, entity, old.as_ref(), Some(&data));
        drop(indexes);

        column.counters.record_write(started.elapsed());
        Ok(())
    }

    /// Returns a copy of `entity`'s instance of `component`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the entity has no such component.
    pub fn get(&self, entity: EntityId, component: &str) -> Result<Value, StorageError> {
        let started = Instant::now();
        let (column, table) = self.column_and_table(component)?;
        let row = table.get(&RowKey::Entity(entity));
        column.counters.record_read(started.elapsed());
        row.ok_or_else(|| StorageError::NotFound {
            entity,
            component: component.to_string(),
        })
    }

    #[must_use]
    pub fn has(&self, entity: EntityId, component: &str) -> bool {
        self.tables
            .table(component)
            .is_ok_and(|t| t.contains(&RowKey::Entity(entity)))
    }

    /// Merge `patch` into an existing instance and store the result.
    ///
    /// Top-level fields of an object patch replace the stored ones; any other
    /// patch replaces the value outright. The merged value is validated
    /// before it is written. Returns the stored value.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if there is nothing to update or
    /// [`StorageError::ValidationFailed`] if the merged value is rejected.
    pub fn update(
        &self,
        entity: EntityId,
        component: &str,
        patch: Value,
    ) -> Result<Value, StorageError> {
        let started = Instant::now();
        let (column, table) = self.column_and_table(component)?;
        let key = RowKey::Entity(entity);

        let mut indexes = column.indexes.write();
        let Some(current) = table.peek(&key) else {
            drop(indexes);
            column.counters.record_write(started.elapsed());
            return Err(StorageError::NotFound {
                entity,
                component: component.to_string(),
            });
        };
        let merged = merge_patch(&current, patch);
        if let Err(err) = column.ty.validate(&merged) {
            drop(indexes);
            return Err(Self::reject(&column, entity, started, err));
        }
        table.insert(key, merged.clone());
        reindex(&mut indexes, entity, Some(&current), Some(&merged));
        drop(indexes);

        column.counters.record_write(started.elapsed());
        Ok(merged)
    }

    /// Remove `entity`'s instance of `component`, returning it.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the entity has no such component.
    pub fn remove(&self, entity: EntityId, component: &str) -> Result<Value, StorageError> {
        let started = Instant::now();
        let (column, table) = self.column_and_table(component)?;

        let mut indexes = column.indexes.write();
        let old = table.remove(&RowKey::Entity(entity));
        reindex(&mut indexes, entity, old.as_ref(), None);
        drop(indexes);

        column.counters.record_write(started.elapsed());
        old.ok_or_else(|| StorageError::NotFound {
            entity,
            component: component.to_string(),
        })
    }

    /// Remove every component of `entity`. Returns the removed type names.
    pub fn remove_entity(&self, entity: EntityId) -> Vec<String> {
        let mut removed: Vec<String> = self
            .registered_names()
            .into_iter()
            .filter(|name| self.remove(entity, name).is_ok())
            .collect();
        removed.sort();
        if !removed.is_empty() {
            debug!(%entity, components = removed.len(), "removed entity components");
        }
        removed
    }

    /// Every component instance `entity` holds, keyed by type name.
    #[must_use]
    pub fn components_of(&self, entity: EntityId) -> BTreeMap<String, Value> {
        self.registered_names()
            .into_iter()
            .filter_map(|name| {
                let value = self.get(entity, &name).ok()?;
                Some((name, value))
            })
            .collect()
    }

    fn registered_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.key().clone()).collect()
    }

    /// Entities whose `component.field` currently equals `value`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotIndexed`] if `field` has no index.
    pub fn query_by_index(
        &self,
        component: &str,
        field: &str,
        value: &Value,
    ) -> Result<HashSet<EntityId>, StorageError> {
        let started = Instant::now();
        let column = self.column(component)?;
        let indexes = column.indexes.read();
        let index = indexes.get(field).ok_or_else(|| StorageError::NotIndexed {
            component: component.to_string(),
            field: field.to_string(),
        })?;
        let result = index.get(&IndexKey::of(value));
        drop(indexes);
        column.counters.record_read(started.elapsed());
        Ok(result)
    }

    fn entity_set(&self, component: &str) -> Result<BTreeSet<EntityId>, StorageError> {
        let started = Instant::now();
        let (column, table) = self.column_and_table(component)?;
        let set = table.entity_keys().into_iter().collect();
        column.counters.record_read(started.elapsed());
        Ok(set)
    }

    /// Entities holding every `required` type, in ascending id order.
    ///
    /// With no required types, returns the entities holding any of the
    /// `optional` types instead.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::TableMissing`] if a named type is not
    /// registered.
    pub fn entities_with(
        &self,
        required: &[&str],
        optional: &[&str],
    ) -> Result<Vec<EntityId>, StorageError> {
        let mut sets = required
            .iter()
            .map(|name| self.entity_set(name))
            .collect::<Result<Vec<_>, _>>()?;
        // Smallest first keeps the intersection cheap.
        sets.sort_by_key(BTreeSet::len);

        let mut sets = sets.into_iter();
        let result = match sets.next() {
            Some(first) => sets.fold(first, |acc, set| &acc & &set),
            None => {
                let mut union = BTreeSet::new();
                for name in optional {
                    union.extend(self.entity_set(name)?);
                }
                union
            }
        };
        Ok(result.into_iter().collect())
    }

    /// Entities matching `query`, in ascending id order.
    ///
    /// A query naming no required or optional types starts from every entity
    /// holding at least one component.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::TableMissing`] if a named type is not
    /// registered.
    pub fn query(&self, query: &ComponentQuery) -> Result<Vec<EntityId>, StorageError> {
        let required: Vec<&str> = query.required.iter().map(String::as_str).collect();
        let optional: Vec<&str> = query.optional.iter().map(String::as_str).collect();

        let candidates = if required.is_empty() && optional.is_empty() {
            let names = self.registered_names();
            let all: Vec<&str> = names.iter().map(String::as_str).collect();
            self.entities_with(&[], &all)?
        } else {
            self.entities_with(&required, &optional)?
        };

        for name in &query.excluded {
            self.column(name)?;
        }
        Ok(candidates
            .into_iter()
            .filter(|entity| query.excluded.iter().all(|name| !self.has(*entity, name)))
            .collect())
    }

    /// Drop index entries that no longer match their row.
    ///
    /// Rows are only read, so this runs alongside readers. Writers to the
    /// same type wait until it finishes.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::TableMissing`] for an unregistered type.
    pub fn optimize(&self, component: &str) -> Result<OptimizeReport, StorageError> {
        let (column, table) = self.column_and_table(component)?;
        let mut indexes = column.indexes.write();
        let mut removed_entries = 0;
        for (field, index) in indexes.iter_mut() {
            removed_entries += index.retain(|key, entity| {
                table
                    .peek(&RowKey::Entity(entity))
                    .and_then(|row| IndexKey::of_field(&row, field))
                    .is_some_and(|current| &current == key)
            });
        }
        drop(indexes);

        info!(component, removed_entries, "optimized indexes");
        Ok(OptimizeReport {
            component: component.to_string(),
            removed_entries,
        })
    }

    fn rebuild_column(column: &ComponentColumn, table: &Table) {
        let mut indexes = column.indexes.write();
        for index in indexes.values_mut() {
            index.clear();
        }
        for (key, row) in table.rows() {
            if let Some(entity) = key.as_entity() {
                reindex(&mut indexes, entity, None, Some(&row));
            }
        }
    }

    /// Rebuild every index of `component` from its table.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::TableMissing`] if the type or its table is
    /// missing.
    pub fn rebuild_indexes(&self, component: &str) -> Result<(), StorageError> {
        let (column, table) = self.column_and_table(component)?;
        Self::rebuild_column(&column, &table);
        debug!(component, rows = table.len(), "rebuilt indexes");
        Ok(())
    }

    /// Rebuild the indexes of every registered type.
    ///
    /// # Errors
    ///
    /// Returns the first [`StorageError::TableMissing`] encountered.
    pub fn rebuild_all_indexes(&self) -> Result<(), StorageError> {
        for name in self.registered_names() {
            self.rebuild_indexes(&name)?;
        }
        Ok(())
    }

    /// Counters for one component type.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::TableMissing`] for an unregistered type.
    pub fn stats(&self, component: &str) -> Result<ComponentStats, StorageError> {
        let (column, table) = self.column_and_table(component)?;
        Ok(column.counters.snapshot(component, table.len()))
    }

    /// Counters for every registered type, ordered by name.
    #[must_use]
    pub fn performance_report(&self) -> PerformanceReport {
        let mut names = self.registered_names();
        names.sort();
        PerformanceReport {
            generated_at: Utc::now(),
            components: names
                .iter()
                .filter_map(|name| self.stats(name).ok())
                .collect(),
        }
    }
}

impl std::fmt::Debug for ComponentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentStore")
            .field("tables", &self.tables.name())
            .field("components", &self.registered_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use engine_component::FieldType;
    use serde_json::json;

    use super::*;

    fn e(n: u64) -> EntityId {
        EntityId::from_raw(n)
    }

    fn make_store() -> ComponentStore {
        let store = ComponentStore::new(Arc::new(TableManager::new("test")));
        store
            .register(
                ComponentType::new("health")
                    .field("current", FieldType::Float)
                    .field("max", FieldType::Float)
                    .indexed("max")
                    .with_validator(|v| match v["current"].as_f64() {
                        Some(c) if c < 0.0 => Err("health cannot be negative".into()),
                        _ => Ok(()),
                    }),
            )
            .unwrap();
        store
            .register(
                ComponentType::new("team")
                    .field("name", FieldType::String)
                    .indexed("name"),
            )
            .unwrap();
        store.register(ComponentType::new("frozen")).unwrap();
        store
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let store = make_store();
        assert!(matches!(
            store.register(ComponentType::new("health")),
            Err(StorageError::DuplicateComponent(_))
        ));
        let names: Vec<_> = store
            .component_types()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["frozen", "health", "team"]);
        assert_eq!(store.tables().stats("health").unwrap().owner, STORE_OWNER);

        let metadata = store.tables().table("health").unwrap().metadata();
        assert_eq!(metadata["name"], "health");
        assert_eq!(metadata["indexed"], json!(["max"]));
    }

    #[test]
    fn test_put_and_get() {
        let store = make_store();
        store
            .put(e(1), "health", json!({"current": 5.0, "max": 10.0}))
            .unwrap();
        assert_eq!(
            store.get(e(1), "health").unwrap(),
            json!({"current": 5.0, "max": 10.0})
        );
        assert!(store.has(e(1), "health"));
        assert!(matches!(
            store.get(e(2), "health"),
            Err(StorageError::NotFound { .. })
        ));
    }

    #[test]
    fn test_rejected_put_changes_nothing() {
        let store = make_store();
        store
            .put(e(1), "health", json!({"current": 5.0, "max": 10.0}))
            .unwrap();

        let err = store
            .put(e(1), "health", json!({"current": -1.0, "max": 20.0}))
            .unwrap_err();
        assert!(matches!(err, StorageError::ValidationFailed(_)));
        assert!(store
            .put(e(2), "health", json!({"current": "lots", "max": 20.0}))
            .is_err());

        assert_eq!(
            store.get(e(1), "health").unwrap(),
            json!({"current": 5.0, "max": 10.0})
        );
        assert!(!store.has(e(2), "health"));
        assert!(store
            .query_by_index("health", "max", &json!(20.0))
            .unwrap()
            .is_empty());
        assert_eq!(
            store.query_by_index("health", "max", &json!(10.0)).unwrap(),
            HashSet::from([e(1)])
        );
        assert_eq!(store.stats("health").unwrap().validation_failures, 2);
    }

    #[test]
    fn test_update_merges_and_moves_index() {
        let store = make_store();
        store.put(e(1), "team", json!({"name": "red"})).unwrap();
        store
            .put(e(1), "health", json!({"current": 5.0, "max": 10.0}))
            .unwrap();

        let merged = store.update(e(1), "health", json!({"max": 12.0})).unwrap();
        assert_eq!(merged, json!({"current": 5.0, "max": 12.0}));
        assert!(store
            .query_by_index("health", "max", &json!(10.0))
            .unwrap()
            .is_empty());

        store.update(e(1), "team", json!({"name": "blue"})).unwrap();
        assert!(store
            .query_by_index("team", "name", &json!("red"))
            .unwrap()
            .is_empty());
        assert_eq!(
            store.query_by_index("team", "name", &json!("blue")).unwrap(),
            HashSet::from([e(1)])
        );
    }

    #[test]
    fn test_update_missing_and_rejected() {
        let store = make_store();
        assert!(matches!(
            store.update(e(9), "health", json!({"max": 1.0})),
            Err(StorageError::NotFound { .. })
        ));

        store
            .put(e(1), "health", json!({"current": 5.0, "max": 10.0}))
            .unwrap();
        assert!(store
            .update(e(1), "health", json!({"current": -3.0}))
            .is_err());
        assert_eq!(store.get(e(1), "health").unwrap()["current"], json!(5.0));
    }

    #[test]
    fn test_query_by_index_is_exact() {
        let store = make_store();
        for (n, team) in [(1, "red"), (2, "blue"), (3, "red"), (4, "green")] {
            store.put(e(n), "team", json!({ "name": team })).unwrap();
        }
        store.put(e(3), "team", json!({"name": "blue"})).unwrap();
        store.remove(e(4), "team").unwrap();

        assert_eq!(
            store.query_by_index("team", "name", &json!("red")).unwrap(),
            HashSet::from([e(1)])
        );
        assert_eq!(
            store.query_by_index("team", "name", &json!("blue")).unwrap(),
            HashSet::from([e(2), e(3)])
        );
        assert!(store
            .query_by_index("team", "name", &json!("green"))
            .unwrap()
            .is_empty());
        assert!(matches!(
            store.query_by_index("health", "current", &json!(1.0)),
            Err(StorageError::NotIndexed { .. })
        ));
    }

    #[test]
    fn test_entities_with_and_query() {
        let store = make_store();
        store.put(e(1), "team", json!({"name": "red"})).unwrap();
        store.put(e(2), "team", json!({"name": "red"})).unwrap();
        store
            .put(e(2), "health", json!({"current": 1.0, "max": 1.0}))
            .unwrap();
        store
            .put(e(3), "health", json!({"current": 1.0, "max": 1.0}))
            .unwrap();
        store.put(e(3), "frozen", Value::Null).unwrap();

        assert_eq!(store.entities_with(&["team", "health"], &[]).unwrap(), vec![e(2)]);
        assert_eq!(
            store.entities_with(&[], &["team", "frozen"]).unwrap(),
            vec![e(1), e(2), e(3)]
        );
        assert!(matches!(
            store.entities_with(&["mana"], &[]),
            Err(StorageError::TableMissing(_))
        ));

        let query = ComponentQuery::new().require("health").exclude("frozen");
        assert_eq!(store.query(&query).unwrap(), vec![e(2)]);
        assert_eq!(
            store.query(&ComponentQuery::new()).unwrap(),
            vec![e(1), e(2), e(3)]
        );
    }

    #[test]
    fn test_remove_entity_and_components_of() {
        let store = make_store();
        store.put(e(1), "team", json!({"name": "red"})).unwrap();
        store.put(e(1), "frozen", Value::Null).unwrap();

        let components = store.components_of(e(1));
        assert_eq!(components.len(), 2);
        assert_eq!(components["team"], json!({"name": "red"}));

        assert_eq!(store.remove_entity(e(1)), vec!["frozen", "team"]);
        assert!(store.components_of(e(1)).is_empty());
        assert!(store
            .query_by_index("team", "name", &json!("red"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_optimize_drops_stale_entries() {
        let store = make_store();
        store.put(e(1), "team", json!({"name": "red"})).unwrap();
        store.put(e(2), "team", json!({"name": "red"})).unwrap();

        // Bypass the store so the index goes stale.
        let table = store.tables().table("team").unwrap();
        table.remove(&RowKey::Entity(e(1)));
        table.insert(RowKey::Entity(e(2)), json!({"name": "blue"}));

        let report = store.optimize("team").unwrap();
        assert_eq!(report.removed_entries, 2);
        assert!(store
            .query_by_index("team", "name", &json!("red"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_rebuild_after_restore() {
        let store = make_store();
        store.put(e(1), "team", json!({"name": "red"})).unwrap();
        let backup = store.tables().backup();

        store.remove(e(1), "team").unwrap();
        store.put(e(2), "team", json!({"name": "red"})).unwrap();
        store.tables().restore(&backup);
        store.rebuild_all_indexes().unwrap();

        assert_eq!(
            store.query_by_index("team", "name", &json!("red")).unwrap(),
            HashSet::from([e(1)])
        );
        assert!(!store.has(e(2), "team"));
    }

    #[test]
    fn test_stats_count_every_operation() {
        let store = make_store();
        store.put(e(1), "team", json!({"name": "red"})).unwrap();
        let _ = store.get(e(1), "team");
        let _ = store.get(e(2), "team");
        store.update(e(1), "team", json!({"name": "blue"})).unwrap();

        let stats = store.stats("team").unwrap();
        assert_eq!(stats.write_count, 2);
        assert_eq!(stats.read_count, 2);
        assert_eq!(stats.entity_count, 1);

        let report = store.performance_report();
        assert_eq!(report.components.len(), 3);
        assert_eq!(report.total_writes(), 2);
    }

    #[test]
    fn test_concurrent_writes_keep_index_consistent() {
        let store = make_store();
        std::thread::scope(|scope| {
            for _ in 0..4 {
                let store = &store;
                scope.spawn(move || {
                    for round in 0..50u64 {
                        let team = if round % 2 == 0 { "red" } else { "blue" };
                        store
                            .put(e(round % 10), "team", json!({ "name": team }))
                            .unwrap();
                    }
                });
            }
        });

        for team in ["red", "blue"] {
            let indexed = store.query_by_index("team", "name", &json!(team)).unwrap();
            for entity in &indexed {
                assert_eq!(store.get(*entity, "team").unwrap()["name"], json!(team));
            }
        }
        let red = store.query_by_index("team", "name", &json!("red")).unwrap();
        let blue = store.query_by_index("team", "name", &json!("blue")).unwrap();
        assert_eq!(red.len() + blue.len(), 10);
    }
}
