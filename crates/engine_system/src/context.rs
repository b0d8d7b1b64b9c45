//! Per-run execution context provided to systems.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use engine_component::{ComponentQuery, EntityId};
use engine_entity::{EntityRegistry, Relationships};
use engine_storage::{ComponentStore, StorageError};
use parking_lot::{RwLock, RwLockReadGuard};
use serde_json::Value;

use crate::error::SystemError;

/// Context provided to a system each time it runs.
///
/// Carries tick metadata, component storage and read access to the entity
/// registry and relationships. Writes made through [`SystemContext::write`],
/// [`SystemContext::update`] and [`SystemContext::remove`] bump the entity's
/// version under the registry write lock and are recorded so the caller can
/// see what a run changed.
///
/// A context built with [`SystemContext::new`] owns an empty registry; the
/// world hands systems a context attached to its own with
/// [`SystemContext::with_entities`].
#[derive(Debug)]
pub struct SystemContext {
    /// The current tick ID.
    pub tick_id: u64,
    /// Delta time since the last tick, in seconds.
    pub dt: f64,
    store: Arc<ComponentStore>,
    registry: Arc<RwLock<EntityRegistry>>,
    relationships: Arc<RwLock<Relationships>>,
    cancelled: Option<Arc<AtomicBool>>,
    changed: Vec<(EntityId, String)>,
}

impl SystemContext {
    /// Create a new context for a tick.
    #[must_use]
    pub fn new(tick_id: u64, dt: f64, store: Arc<ComponentStore>) -> Self {
        Self {
            tick_id,
            dt,
            store,
            registry: Arc::new(RwLock::new(EntityRegistry::default())),
            relationships: Arc::new(RwLock::new(Relationships::new())),
            cancelled: None,
            changed: Vec::new(),
        }
    }

    /// Attach the registry and relationships the store's entities live in.
    #[must_use]
    pub fn with_entities(
        mut self,
        registry: Arc<RwLock<EntityRegistry>>,
        relationships: Arc<RwLock<Relationships>>,
    ) -> Self {
        self.registry = registry;
        self.relationships = relationships;
        self
    }

    /// Refuse every write once `flag` is set.
    ///
    /// The flag is checked while the registry write lock is held, so once the
    /// setter has taken and released that lock no further write lands.
    #[must_use]
    pub fn with_cancellation(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancelled = Some(flag);
        self
    }

    #[must_use]
    pub fn store(&self) -> &ComponentStore {
        &self.store
    }

    /// Read access to entity records, for tag, status and archetype queries.
    ///
    /// The guard borrows the context, so it must be dropped before writing.
    pub fn registry(&self) -> RwLockReadGuard<'_, EntityRegistry> {
        self.registry.read()
    }

    /// Read access to hierarchy, groups and typed edges.
    ///
    /// Traversals also need [`SystemContext::registry`]; take that guard first.
    pub fn relationships(&self) -> RwLockReadGuard<'_, Relationships> {
        self.relationships.read()
    }

    /// `true` once the run has been cancelled and writes are refused.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// The components of `entity` that `query` reads.
    #[must_use]
    pub fn components(&self, entity: EntityId, query: &ComponentQuery) -> BTreeMap<String, Value> {
        query
            .accessed_types()
            .into_iter()
            .filter_map(|name| {
                let value = self.store.get(entity, &name).ok()?;
                Some((name, value))
            })
            .collect()
    }

    /// Store a component value and record the change.
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::Cancelled`] after cancellation, an entity error
    /// for destroyed entities, or the storage error from [`ComponentStore::put`].
    pub fn write(
        &mut self,
        entity: EntityId,
        component: &str,
        data: Value,
    ) -> Result<(), SystemError> {
        self.tracked(entity, component, |store| {
            store.put(entity, component, data)
        })
    }

    /// Merge `patch` into a stored component and record the change. Returns
    /// the merged value.
    ///
    /// # Errors
    ///
    /// As [`SystemContext::write`], with the storage error from
    /// [`ComponentStore::update`].
    pub fn update(
        &mut self,
        entity: EntityId,
        component: &str,
        patch: Value,
    ) -> Result<Value, SystemError> {
        self.tracked(entity, component, |store| {
            store.update(entity, component, patch)
        })
    }

    /// Remove a component and record the change. Returns the removed value.
    ///
    /// # Errors
    ///
    /// As [`SystemContext::write`], with the storage error from
    /// [`ComponentStore::remove`].
    pub fn remove(&mut self, entity: EntityId, component: &str) -> Result<Value, SystemError> {
        self.tracked(entity, component, |store| store.remove(entity, component))
    }

    fn tracked<T>(
        &mut self,
        entity: EntityId,
        component: &str,
        write: impl FnOnce(&ComponentStore) -> Result<T, StorageError>,
    ) -> Result<T, SystemError> {
        let value = {
            let mut registry = self.registry.write();
            if self.is_cancelled() {
                return Err(SystemError::Cancelled {
                    entity,
                    component: component.to_string(),
                });
            }
            let written: Result<T, SystemError> =
                registry.component_write(entity, || write(self.store.as_ref()));
            written?
        };
        self.changed.push((entity, component.to_string()));
        Ok(value)
    }

    /// `(entity, component)` pairs written during this run, in write order.
    #[must_use]
    pub fn changed(&self) -> &[(EntityId, String)] {
        &self.changed
    }
}

#[cfg(test)]
mod tests {
    use engine_component::{ComponentType, FieldType};
    use engine_entity::{CreateOptions, EntityError};
    use engine_storage::TableManager;
    use serde_json::json;

    use super::*;

    fn make_store() -> Arc<ComponentStore> {
        let store = ComponentStore::new(Arc::new(TableManager::new("test")));
        store
            .register(ComponentType::new("position").field("x", FieldType::Int))
            .unwrap();
        Arc::new(store)
    }

    fn make_attached() -> (SystemContext, Arc<RwLock<EntityRegistry>>) {
        let registry = Arc::new(RwLock::new(EntityRegistry::default()));
        let relationships = Arc::new(RwLock::new(Relationships::new()));
        let ctx = SystemContext::new(1, 0.016, make_store())
            .with_entities(Arc::clone(&registry), relationships);
        (ctx, registry)
    }

    #[test]
    fn test_context_creation() {
        let ctx = SystemContext::new(1, 0.016, make_store());
        assert_eq!(ctx.tick_id, 1);
        assert!((ctx.dt - 0.016).abs() < f64::EPSILON);
        assert!(ctx.changed().is_empty());
        assert!(!ctx.is_cancelled());
        assert_eq!(ctx.registry().count(), 0);
    }

    #[test]
    fn test_write_records_changes() {
        let mut ctx = SystemContext::new(1, 0.016, make_store());
        let entity = EntityId::from_raw(1);
        ctx.write(entity, "position", json!({"x": 3})).unwrap();
        assert!(ctx.write(entity, "position", json!({"x": "far"})).is_err());

        assert_eq!(ctx.changed(), &[(entity, "position".to_string())]);
        let query = ComponentQuery::new().require("position").optional("velocity");
        let components = ctx.components(entity, &query);
        assert_eq!(components.len(), 1);
        assert_eq!(components["position"], json!({"x": 3}));
    }

    #[test]
    fn test_writes_bump_entity_version() {
        let (mut ctx, registry) = make_attached();
        let entity = registry.write().create(CreateOptions::new());

        ctx.write(entity, "position", json!({"x": 1})).unwrap();
        let merged = ctx.update(entity, "position", json!({"x": 2})).unwrap();
        assert_eq!(merged, json!({"x": 2}));
        assert!(ctx.update(entity, "position", json!({"x": "far"})).is_err());
        ctx.remove(entity, "position").unwrap();

        assert_eq!(ctx.registry().get(entity).unwrap().version, 4);
        assert_eq!(ctx.changed().len(), 3);
    }

    #[test]
    fn test_write_to_destroyed_entity_refused() {
        let (mut ctx, registry) = make_attached();
        let entity = registry.write().create(CreateOptions::new());
        registry.write().destroy(entity).unwrap();

        let err = ctx.write(entity, "position", json!({"x": 1})).unwrap_err();
        assert!(matches!(
            err,
            SystemError::Entity(EntityError::InvalidStatus { .. })
        ));
        assert!(!ctx.store().has(entity, "position"));
        assert!(ctx.changed().is_empty());
    }

    #[test]
    fn test_cancelled_context_refuses_writes() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut ctx =
            SystemContext::new(1, 0.016, make_store()).with_cancellation(Arc::clone(&flag));
        let entity = EntityId::from_raw(1);
        ctx.write(entity, "position", json!({"x": 1})).unwrap();

        flag.store(true, Ordering::SeqCst);
        assert!(ctx.is_cancelled());
        assert!(matches!(
            ctx.write(entity, "position", json!({"x": 2})),
            Err(SystemError::Cancelled { .. })
        ));
        assert_eq!(ctx.store().get(entity, "position").unwrap(), json!({"x": 1}));
        assert_eq!(ctx.changed().len(), 1);
    }
}
