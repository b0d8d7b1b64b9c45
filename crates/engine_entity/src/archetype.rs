//! Archetypes: named entity templates.
//!
//! An archetype lists default component data and may inherit from one
//! parent. Resolution walks from the root ancestor down to the archetype,
//! letting each child override what its parent declared. Spawning
//! materializes the resolved template, optionally applying a named
//! variation, per-spawn overrides and exclusions.
//!
//! A variation can be declared on a single component
//! ([`ArchetypeComponent::with_variation`]) or on the archetype as a whole
//! ([`Archetype::with_variation`]). Archetype-level sets may touch several
//! components and add ones the template lacks; they apply after the
//! per-component variations.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::EntityError;

/// One component slot of an archetype.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchetypeComponent {
    pub component: String,
    pub defaults: Value,
    /// Required components cannot be excluded at spawn time.
    pub required: bool,
    /// Variation name → data merged over `defaults`.
    pub variations: BTreeMap<String, Value>,
}

impl ArchetypeComponent {
    #[must_use]
    pub fn new(component: impl Into<String>, defaults: Value) -> Self {
        Self {
            component: component.into(),
            defaults,
            required: false,
            variations: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub fn with_variation(mut self, name: impl Into<String>, data: Value) -> Self {
        self.variations.insert(name.into(), data);
        self
    }
}

/// Settings applied to every entity spawned from an archetype.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpawnConfig {
    pub tags: BTreeSet<String>,
    pub metadata: Map<String, Value>,
}

/// Variation name → component → data merged over the template.
pub type VariationSets = BTreeMap<String, BTreeMap<String, Value>>;

/// A named entity template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Archetype {
    pub name: String,
    pub parent: Option<String>,
    pub components: Vec<ArchetypeComponent>,
    pub spawn: SpawnConfig,
    #[serde(default)]
    pub variations: VariationSets,
}

impl Archetype {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            components: Vec::new(),
            spawn: SpawnConfig::default(),
            variations: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    #[must_use]
    pub fn with_component(mut self, component: ArchetypeComponent) -> Self {
        self.components.push(component);
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.spawn.tags.insert(tag.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.spawn.metadata.insert(key.into(), value);
        self
    }

    /// Add `component` data to the archetype-level variation `name`.
    #[must_use]
    pub fn with_variation(
        mut self,
        name: impl Into<String>,
        component: impl Into<String>,
        data: Value,
    ) -> Self {
        self.variations
            .entry(name.into())
            .or_default()
            .insert(component.into(), data);
        self
    }
}

/// An archetype flattened along its parent chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedArchetype {
    pub name: String,
    /// Root ancestor first, the archetype itself last.
    pub chain: Vec<String>,
    /// In order of first declaration along the chain.
    pub components: Vec<ArchetypeComponent>,
    pub spawn: SpawnConfig,
    /// Archetype-level variations merged along the chain.
    pub variation_sets: VariationSets,
}

impl ResolvedArchetype {
    /// Every variation name declared by a component or the archetype.
    #[must_use]
    pub fn variations(&self) -> BTreeSet<String> {
        self.components
            .iter()
            .flat_map(|c| c.variations.keys().cloned())
            .chain(self.variation_sets.keys().cloned())
            .collect()
    }

    #[must_use]
    pub fn component(&self, name: &str) -> Option<&ArchetypeComponent> {
        self.components.iter().find(|c| c.component == name)
    }
}

/// Per-spawn adjustments to an archetype.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpawnOptions {
    pub variation: Option<String>,
    /// Component → data merged over the template (or added if absent).
    pub overrides: BTreeMap<String, Value>,
    pub exclude: BTreeSet<String>,
    pub tags: BTreeSet<String>,
    pub metadata: Map<String, Value>,
}

impl SpawnOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_variation(mut self, variation: impl Into<String>) -> Self {
        self.variation = Some(variation.into());
        self
    }

    #[must_use]
    pub fn with_override(mut self, component: impl Into<String>, data: Value) -> Self {
        self.overrides.insert(component.into(), data);
        self
    }

    #[must_use]
    pub fn excluding(mut self, component: impl Into<String>) -> Self {
        self.exclude.insert(component.into());
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

/// The concrete result of spawning from an archetype.
#[derive(Debug, Clone, PartialEq)]
pub struct Materialized {
    pub archetype: String,
    pub components: BTreeMap<String, Value>,
    pub tags: BTreeSet<String>,
    pub metadata: Map<String, Value>,
}

/// Merge `over` onto `base`: objects merge key by key, anything else is
/// replaced.
fn merge_data(base: &Value, over: &Value) -> Value {
    match (base, over) {
        (Value::Object(base), Value::Object(over)) => {
            let mut merged = base.clone();
            for (key, value) in over {
                let next = match merged.get(key) {
                    Some(existing) => merge_data(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        (_, over) => over.clone(),
    }
}

/// Registry of archetypes.
#[derive(Debug, Default)]
pub struct ArchetypeResolver {
    archetypes: BTreeMap<String, Archetype>,
}

impl ArchetypeResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` if walking up from `parent` reaches `name`.
    fn reaches(&self, parent: Option<&str>, name: &str) -> bool {
        let mut seen = HashSet::new();
        let mut current = parent;
        while let Some(p) = current {
            if p == name || !seen.insert(p) {
                return true;
            }
            current = self.archetypes.get(p).and_then(|a| a.parent.as_deref());
        }
        false
    }

    fn check_parent(&self, archetype: &Archetype) -> Result<(), EntityError> {
        if let Some(parent) = &archetype.parent {
            if parent != &archetype.name && !self.archetypes.contains_key(parent) {
                return Err(EntityError::ArchetypeNotFound(parent.clone()));
            }
            if self.reaches(Some(parent), &archetype.name) {
                return Err(EntityError::ArchetypeCycle(archetype.name.clone()));
            }
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`EntityError::DuplicateArchetype`], or
    /// [`EntityError::ArchetypeNotFound`] / [`EntityError::ArchetypeCycle`]
    /// for a bad parent.
    pub fn register(&mut self, archetype: Archetype) -> Result<(), EntityError> {
        if self.archetypes.contains_key(&archetype.name) {
            return Err(EntityError::DuplicateArchetype(archetype.name));
        }
        self.check_parent(&archetype)?;
        info!(archetype = %archetype.name, parent = ?archetype.parent, "registered archetype");
        self.archetypes.insert(archetype.name.clone(), archetype);
        Ok(())
    }

    /// Replace an existing archetype.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::ArchetypeNotFound`] if it does not exist, or
    /// [`EntityError::ArchetypeCycle`] if the new parent would loop.
    pub fn update(&mut self, archetype: Archetype) -> Result<(), EntityError> {
        if !self.archetypes.contains_key(&archetype.name) {
            return Err(EntityError::ArchetypeNotFound(archetype.name));
        }
        self.check_parent(&archetype)?;
        debug!(archetype = %archetype.name, "updated archetype");
        self.archetypes.insert(archetype.name.clone(), archetype);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`EntityError::ArchetypeInUse`] while other archetypes inherit
    /// from it.
    pub fn unregister(&mut self, name: &str) -> Result<Archetype, EntityError> {
        let children: Vec<String> = self
            .archetypes
            .values()
            .filter(|a| a.parent.as_deref() == Some(name))
            .map(|a| a.name.clone())
            .collect();
        if !children.is_empty() {
            return Err(EntityError::ArchetypeInUse {
                name: name.to_string(),
                children,
            });
        }
        self.archetypes
            .remove(name)
            .ok_or_else(|| EntityError::ArchetypeNotFound(name.to_string()))
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Archetype> {
        self.archetypes.get(name)
    }

    /// Archetype names, ascending.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.archetypes.keys().cloned().collect()
    }

    /// All archetypes, ordered by name.
    pub fn archetypes(&self) -> impl Iterator<Item = &Archetype> {
        self.archetypes.values()
    }

    /// Flatten `name` along its parent chain, child over parent.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::ArchetypeNotFound`] if `name` or an ancestor is
    /// missing.
    pub fn resolve(&self, name: &str) -> Result<ResolvedArchetype, EntityError> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(name);
        while let Some(n) = current {
            if !seen.insert(n) {
                return Err(EntityError::ArchetypeCycle(name.to_string()));
            }
            let archetype = self
                .archetypes
                .get(n)
                .ok_or_else(|| EntityError::ArchetypeNotFound(n.to_string()))?;
            chain.push(archetype);
            current = archetype.parent.as_deref();
        }
        chain.reverse();

        let mut components: Vec<ArchetypeComponent> = Vec::new();
        let mut spawn = SpawnConfig::default();
        let mut variation_sets = VariationSets::new();
        for archetype in &chain {
            for declared in &archetype.components {
                match components
                    .iter_mut()
                    .find(|c| c.component == declared.component)
                {
                    Some(existing) => {
                        existing.defaults = merge_data(&existing.defaults, &declared.defaults);
                        existing.required = declared.required;
                        existing
                            .variations
                            .extend(declared.variations.clone());
                    }
                    None => components.push(declared.clone()),
                }
            }
            spawn.tags.extend(archetype.spawn.tags.iter().cloned());
            for (key, value) in &archetype.spawn.metadata {
                spawn.metadata.insert(key.clone(), value.clone());
            }
            for (variation, set) in &archetype.variations {
                let merged = variation_sets.entry(variation.clone()).or_default();
                for (component, data) in set {
                    let next = match merged.get(component) {
                        Some(existing) => merge_data(existing, data),
                        None => data.clone(),
                    };
                    merged.insert(component.clone(), next);
                }
            }
        }

        Ok(ResolvedArchetype {
            name: name.to_string(),
            chain: chain.iter().map(|a| a.name.clone()).collect(),
            components,
            spawn,
            variation_sets,
        })
    }

    /// Produce the concrete components, tags and metadata for a spawn.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::UnknownVariation`] for a variation neither the
    /// archetype nor any component declares, and [`EntityError::RequiredComponent`] when excluding a
    /// required component.
    pub fn materialize(
        &self,
        name: &str,
        options: &SpawnOptions,
    ) -> Result<Materialized, EntityError> {
        let resolved = self.resolve(name)?;
        if let Some(variation) = &options.variation
            && !resolved.variations().contains(variation)
        {
            return Err(EntityError::UnknownVariation {
                archetype: name.to_string(),
                variation: variation.clone(),
            });
        }
        if let Some(required) = resolved
            .components
            .iter()
            .find(|c| c.required && options.exclude.contains(&c.component))
        {
            return Err(EntityError::RequiredComponent {
                archetype: name.to_string(),
                component: required.component.clone(),
            });
        }

        let mut components = BTreeMap::new();
        for slot in &resolved.components {
            if options.exclude.contains(&slot.component) {
                continue;
            }
            let mut data = slot.defaults.clone();
            if let Some(variation) = &options.variation
                && let Some(over) = slot.variations.get(variation)
            {
                data = merge_data(&data, over);
            }
            components.insert(slot.component.clone(), data);
        }
        if let Some(set) = options
            .variation
            .as_ref()
            .and_then(|v| resolved.variation_sets.get(v))
        {
            for (component, over) in set {
                if options.exclude.contains(component) {
                    continue;
                }
                let data = match components.get(component) {
                    Some(base) => merge_data(base, over),
                    None => over.clone(),
                };
                components.insert(component.clone(), data);
            }
        }
        for (component, over) in &options.overrides {
            if options.exclude.contains(component) {
                continue;
            }
            let data = match components.get(component) {
                Some(base) => merge_data(base, over),
                None => over.clone(),
            };
            components.insert(component.clone(), data);
        }

        let mut tags = resolved.spawn.tags;
        tags.extend(options.tags.iter().cloned());
        let mut metadata = resolved.spawn.metadata;
        for (key, value) in &options.metadata {
            metadata.insert(key.clone(), value.clone());
        }

        Ok(Materialized {
            archetype: name.to_string(),
            components,
            tags,
            metadata,
        })
    }

    /// Replace every archetype, as after a restore. Entries are inserted
    /// without parent checks since they were valid when backed up.
    pub fn restore(&mut self, archetypes: Vec<Archetype>) {
        self.archetypes = archetypes
            .into_iter()
            .map(|a| (a.name.clone(), a))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn make_resolver() -> ArchetypeResolver {
        let mut resolver = ArchetypeResolver::new();
        resolver
            .register(
                Archetype::new("creature")
                    .with_component(
                        ArchetypeComponent::new("health", json!({"current": 10.0, "max": 10.0}))
                            .required(),
                    )
                    .with_component(ArchetypeComponent::new("position", json!({"x": 0, "y": 0})))
                    .with_tag("creature"),
            )
            .unwrap();
        resolver
            .register(
                Archetype::new("orc")
                    .with_parent("creature")
                    .with_component(
                        ArchetypeComponent::new("health", json!({"max": 30.0}))
                            .required()
                            .with_variation("elite", json!({"max": 60.0, "current": 60.0})),
                    )
                    .with_component(ArchetypeComponent::new("team", json!({"name": "horde"})))
                    .with_metadata("loot", json!("axe"))
                    .with_variation("scout", "position", json!({"y": 8}))
                    .with_variation("scout", "speed", json!({"value": 2.0})),
            )
            .unwrap();
        resolver
    }

    #[test]
    fn test_resolve_merges_child_over_parent() {
        let resolver = make_resolver();
        let orc = resolver.resolve("orc").unwrap();
        assert_eq!(orc.chain, vec!["creature", "orc"]);
        assert_eq!(
            orc.component("health").unwrap().defaults,
            json!({"current": 10.0, "max": 30.0})
        );
        assert_eq!(
            orc.components.iter().map(|c| c.component.as_str()).collect::<Vec<_>>(),
            vec!["health", "position", "team"]
        );
        assert!(orc.spawn.tags.contains("creature"));
        assert_eq!(
            orc.variations(),
            BTreeSet::from(["elite".to_string(), "scout".to_string()])
        );
    }

    #[test]
    fn test_register_rejects_bad_parents() {
        let mut resolver = make_resolver();
        assert!(matches!(
            resolver.register(Archetype::new("orc")),
            Err(EntityError::DuplicateArchetype(_))
        ));
        assert!(matches!(
            resolver.register(Archetype::new("ghost").with_parent("spirit")),
            Err(EntityError::ArchetypeNotFound(_))
        ));
        assert!(matches!(
            resolver.register(Archetype::new("loop").with_parent("loop")),
            Err(EntityError::ArchetypeCycle(_))
        ));
        assert!(matches!(
            resolver.update(Archetype::new("creature").with_parent("orc")),
            Err(EntityError::ArchetypeCycle(_))
        ));
        assert!(resolver.get("creature").unwrap().parent.is_none());
    }

    #[test]
    fn test_unregister_in_use() {
        let mut resolver = make_resolver();
        assert_eq!(
            resolver.unregister("creature"),
            Err(EntityError::ArchetypeInUse {
                name: "creature".to_string(),
                children: vec!["orc".to_string()],
            })
        );
        resolver.unregister("orc").unwrap();
        resolver.unregister("creature").unwrap();
        assert!(resolver.names().is_empty());
    }

    #[test]
    fn test_materialize_with_variation_and_overrides() {
        let resolver = make_resolver();
        let spawned = resolver
            .materialize(
                "orc",
                &SpawnOptions::new()
                    .with_variation("elite")
                    .with_override("position", json!({"x": 5}))
                    .with_override("mana", json!({"points": 3}))
                    .excluding("team")
                    .with_tag("boss"),
            )
            .unwrap();

        assert_eq!(spawned.components["health"], json!({"current": 60.0, "max": 60.0}));
        assert_eq!(spawned.components["position"], json!({"x": 5, "y": 0}));
        assert_eq!(spawned.components["mana"], json!({"points": 3}));
        assert!(!spawned.components.contains_key("team"));
        assert!(spawned.tags.contains("boss") && spawned.tags.contains("creature"));
        assert_eq!(spawned.metadata.get("loot"), Some(&json!("axe")));
    }

    #[test]
    fn test_archetype_level_variation() {
        let mut resolver = make_resolver();
        resolver
            .register(
                Archetype::new("orc_chief")
                    .with_parent("orc")
                    .with_variation("scout", "speed", json!({"value": 3.0})),
            )
            .unwrap();

        let scout = resolver
            .materialize("orc", &SpawnOptions::new().with_variation("scout"))
            .unwrap();
        assert_eq!(scout.components["position"], json!({"x": 0, "y": 8}));
        assert_eq!(scout.components["speed"], json!({"value": 2.0}));
        assert_eq!(scout.components["health"], json!({"current": 10.0, "max": 30.0}));

        let chief = resolver
            .materialize(
                "orc_chief",
                &SpawnOptions::new().with_variation("scout").excluding("position"),
            )
            .unwrap();
        assert_eq!(chief.components["speed"], json!({"value": 3.0}));
        assert!(!chief.components.contains_key("position"));
    }

    #[test]
    fn test_materialize_rejections() {
        let resolver = make_resolver();
        assert!(matches!(
            resolver.materialize("orc", &SpawnOptions::new().excluding("health")),
            Err(EntityError::RequiredComponent { .. })
        ));
        assert!(matches!(
            resolver.materialize("orc", &SpawnOptions::new().with_variation("tiny")),
            Err(EntityError::UnknownVariation { .. })
        ));
        assert!(matches!(
            resolver.materialize("dragon", &SpawnOptions::new()),
            Err(EntityError::ArchetypeNotFound(_))
        ));
    }
}
