//! Relationships between entities.
//!
//! Three kinds of structure are tracked:
//!
//! - the parent/child hierarchy, stored on the registry records themselves
//!   (`parent_id`, `children`) with a depth cache kept here;
//! - named groups with an owner and free-form metadata;
//! - typed, metadata-bearing edges between any two entities.
//!
//! Hierarchy operations take the [`EntityRegistry`] explicitly because they
//! mutate records (and so bump their versions).

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use engine_component::EntityId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::EntityError;
use crate::registry::{CascadePolicy, EntityRegistry};

/// A typed edge between two entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: EntityId,
    pub to: EntityId,
    pub kind: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// A named set of entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub members: BTreeSet<EntityId>,
    pub owner: Option<EntityId>,
    pub group_type: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl Group {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            members: BTreeSet::new(),
            owner: None,
            group_type: "generic".to_string(),
            metadata: Value::Null,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_owner(mut self, owner: EntityId) -> Self {
        self.owner = Some(owner);
        self
    }

    #[must_use]
    pub fn with_type(mut self, group_type: impl Into<String>) -> Self {
        self.group_type = group_type.into();
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// What a cascade removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CascadeReport {
    /// Every entity marked destroyed, the root first.
    pub destroyed: Vec<EntityId>,
    /// Children detached under [`CascadePolicy::Orphan`].
    pub orphaned: Vec<EntityId>,
    pub groups_left: usize,
    pub edges_removed: usize,
}

type EdgeKey = (EntityId, EntityId, String);

/// Groups, typed edges and the hierarchy depth cache.
#[derive(Debug, Default)]
pub struct Relationships {
    edges: BTreeMap<EdgeKey, Edge>,
    outgoing: HashMap<EntityId, BTreeSet<EdgeKey>>,
    incoming: HashMap<EntityId, BTreeSet<EdgeKey>>,
    groups: BTreeMap<String, Group>,
    memberships: HashMap<EntityId, BTreeSet<String>>,
    levels: HashMap<EntityId, usize>,
}

fn require_alive(registry: &EntityRegistry, id: EntityId) -> Result<(), EntityError> {
    let record = registry.get(id)?;
    if record.is_destroyed() {
        return Err(EntityError::InvalidStatus {
            entity: id,
            status: record.status,
            operation: "relate",
        });
    }
    Ok(())
}

impl Relationships {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // -- hierarchy --------------------------------------------------------

    /// Make `child` a child of `parent`, detaching it from any previous
    /// parent.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::SelfParent`], [`EntityError::HierarchyCycle`]
    /// if `child` is an ancestor of `parent`, or [`EntityError::NotFound`].
    /// Nothing changes on error.
    pub fn add_child(
        &mut self,
        registry: &mut EntityRegistry,
        parent: EntityId,
        child: EntityId,
    ) -> Result<(), EntityError> {
        if parent == child {
            return Err(EntityError::SelfParent(child));
        }
        require_alive(registry, parent)?;
        require_alive(registry, child)?;
        if self.ancestors(registry, parent)?.contains(&child) {
            return Err(EntityError::HierarchyCycle { parent, child });
        }

        let previous = registry.get(child)?.parent_id;
        if previous == Some(parent) {
            return Ok(());
        }
        if let Some(old) = previous {
            registry.modify(old, |r| {
                r.children.remove(&child);
            })?;
        }
        registry.modify(parent, |r| {
            r.children.insert(child);
        })?;
        registry.modify(child, |r| r.parent_id = Some(parent))?;
        self.invalidate_levels(registry, child);
        debug!(%parent, %child, "attached child");
        Ok(())
    }

    /// Detach `child` from `parent`.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::NotChild`] if `child` is not a child of
    /// `parent`.
    pub fn remove_child(
        &mut self,
        registry: &mut EntityRegistry,
        parent: EntityId,
        child: EntityId,
    ) -> Result<(), EntityError> {
        registry.get(parent)?;
        if registry.get(child)?.parent_id != Some(parent) {
            return Err(EntityError::NotChild { parent, child });
        }
        self.invalidate_levels(registry, child);
        registry.modify(parent, |r| {
            r.children.remove(&child);
        })?;
        registry.modify(child, |r| r.parent_id = None)?;
        debug!(%parent, %child, "detached child");
        Ok(())
    }

    /// Ancestors of `id`, nearest first.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::NotFound`] if `id` is unknown.
    pub fn ancestors(
        &self,
        registry: &EntityRegistry,
        id: EntityId,
    ) -> Result<Vec<EntityId>, EntityError> {
        let mut current = registry.get(id)?.parent_id;
        let mut seen = HashSet::from([id]);
        let mut ancestors = Vec::new();
        while let Some(parent) = current {
            if !seen.insert(parent) {
                warn!(entity = %id, at = %parent, "parent chain loops; stopping walk");
                break;
            }
            ancestors.push(parent);
            current = registry.get(parent).ok().and_then(|r| r.parent_id);
        }
        Ok(ancestors)
    }

    /// Descendants of `id` in breadth-first order.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::NotFound`] if `id` is unknown.
    pub fn descendants(
        &self,
        registry: &EntityRegistry,
        id: EntityId,
    ) -> Result<Vec<EntityId>, EntityError> {
        let mut queue: VecDeque<EntityId> = registry.get(id)?.children.iter().copied().collect();
        let mut seen = HashSet::from([id]);
        let mut descendants = Vec::new();
        while let Some(next) = queue.pop_front() {
            if !seen.insert(next) {
                continue;
            }
            descendants.push(next);
            if let Ok(record) = registry.get(next) {
                queue.extend(record.children.iter().copied());
            }
        }
        Ok(descendants)
    }

    /// Depth of `id` in the hierarchy; roots are at level 0.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::NotFound`] if `id` is unknown.
    pub fn hierarchy_level(
        &mut self,
        registry: &EntityRegistry,
        id: EntityId,
    ) -> Result<usize, EntityError> {
        if let Some(level) = self.levels.get(&id) {
            return Ok(*level);
        }
        let level = self.ancestors(registry, id)?.len();
        self.levels.insert(id, level);
        Ok(level)
    }

    fn invalidate_levels(&mut self, registry: &EntityRegistry, root: EntityId) {
        self.levels.remove(&root);
        if let Ok(descendants) = self.descendants(registry, root) {
            for id in descendants {
                self.levels.remove(&id);
            }
        }
    }

    // -- groups -----------------------------------------------------------

    /// # Errors
    ///
    /// Returns [`EntityError::DuplicateGroup`] if the id is taken.
    pub fn create_group(&mut self, group: Group) -> Result<(), EntityError> {
        if self.groups.contains_key(&group.id) {
            return Err(EntityError::DuplicateGroup(group.id));
        }
        for member in &group.members {
            self.memberships
                .entry(*member)
                .or_default()
                .insert(group.id.clone());
        }
        debug!(group = %group.id, "created group");
        self.groups.insert(group.id.clone(), group);
        Ok(())
    }

    /// Delete a group and every membership back-reference to it.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::GroupNotFound`].
    pub fn delete_group(&mut self, id: &str) -> Result<Group, EntityError> {
        let group = self
            .groups
            .remove(id)
            .ok_or_else(|| EntityError::GroupNotFound(id.to_string()))?;
        for member in &group.members {
            self.leave(*member, id);
        }
        debug!(group = id, "deleted group");
        Ok(group)
    }

    fn leave(&mut self, entity: EntityId, group: &str) {
        if let Some(groups) = self.memberships.get_mut(&entity) {
            groups.remove(group);
            if groups.is_empty() {
                self.memberships.remove(&entity);
            }
        }
    }

    /// # Errors
    ///
    /// Returns [`EntityError::GroupNotFound`] or [`EntityError::NotFound`].
    pub fn add_to_group(
        &mut self,
        registry: &EntityRegistry,
        group: &str,
        entity: EntityId,
    ) -> Result<(), EntityError> {
        if !self.groups.contains_key(group) {
            return Err(EntityError::GroupNotFound(group.to_string()));
        }
        require_alive(registry, entity)?;
        if let Some(g) = self.groups.get_mut(group) {
            g.members.insert(entity);
        }
        self.memberships
            .entry(entity)
            .or_default()
            .insert(group.to_string());
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`EntityError::GroupNotFound`] or [`EntityError::NotMember`].
    pub fn remove_from_group(&mut self, group: &str, entity: EntityId) -> Result<(), EntityError> {
        let g = self
            .groups
            .get_mut(group)
            .ok_or_else(|| EntityError::GroupNotFound(group.to_string()))?;
        if !g.members.remove(&entity) {
            return Err(EntityError::NotMember {
                group: group.to_string(),
                entity,
            });
        }
        self.leave(entity, group);
        Ok(())
    }

    #[must_use]
    pub fn group(&self, id: &str) -> Option<&Group> {
        self.groups.get(id)
    }

    /// All groups, ordered by id.
    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    /// Ids of the groups `entity` belongs to, ascending.
    #[must_use]
    pub fn groups_of(&self, entity: EntityId) -> Vec<String> {
        self.memberships
            .get(&entity)
            .map(|groups| groups.iter().cloned().collect())
            .unwrap_or_default()
    }

    // -- typed edges ------------------------------------------------------

    /// Add or replace the `kind` edge from `from` to `to`.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::NotFound`] if either endpoint is unknown.
    pub fn add_relationship(
        &mut self,
        registry: &EntityRegistry,
        from: EntityId,
        to: EntityId,
        kind: impl Into<String>,
        metadata: Value,
    ) -> Result<(), EntityError> {
        require_alive(registry, from)?;
        require_alive(registry, to)?;
        let kind = kind.into();
        let key = (from, to, kind.clone());
        self.outgoing.entry(from).or_default().insert(key.clone());
        self.incoming.entry(to).or_default().insert(key.clone());
        self.edges.insert(
            key,
            Edge {
                from,
                to,
                kind,
                metadata,
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`EntityError::RelationshipNotFound`] if no such edge exists.
    pub fn remove_relationship(
        &mut self,
        from: EntityId,
        to: EntityId,
        kind: &str,
    ) -> Result<Edge, EntityError> {
        let key = (from, to, kind.to_string());
        self.remove_edge(&key)
            .ok_or_else(|| EntityError::RelationshipNotFound {
                from,
                to,
                kind: kind.to_string(),
            })
    }

    fn remove_edge(&mut self, key: &EdgeKey) -> Option<Edge> {
        let edge = self.edges.remove(key)?;
        for (index, endpoint) in [(&mut self.outgoing, edge.from), (&mut self.incoming, edge.to)] {
            if let Some(keys) = index.get_mut(&endpoint) {
                keys.remove(key);
                if keys.is_empty() {
                    index.remove(&endpoint);
                }
            }
        }
        Some(edge)
    }

    fn edges_in(&self, index: &HashMap<EntityId, BTreeSet<EdgeKey>>, id: EntityId) -> Vec<&Edge> {
        index
            .get(&id)
            .map(|keys| keys.iter().filter_map(|k| self.edges.get(k)).collect())
            .unwrap_or_default()
    }

    /// Edges leaving `id`.
    #[must_use]
    pub fn relationships_from(&self, id: EntityId) -> Vec<&Edge> {
        self.edges_in(&self.outgoing, id)
    }

    /// Edges arriving at `id`.
    #[must_use]
    pub fn relationships_to(&self, id: EntityId) -> Vec<&Edge> {
        self.edges_in(&self.incoming, id)
    }

    #[must_use]
    pub fn relationships_of_type(&self, kind: &str) -> Vec<&Edge> {
        self.edges.values().filter(|e| e.kind == kind).collect()
    }

    #[must_use]
    pub fn has_relationship(&self, from: EntityId, to: EntityId, kind: &str) -> bool {
        self.edges.contains_key(&(from, to, kind.to_string()))
    }

    /// All edges, ordered by (from, to, kind).
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    // -- cascades ---------------------------------------------------------

    /// Drop every group membership and edge touching `id`.
    pub fn cascade_destroy(&mut self, id: EntityId) -> CascadeReport {
        let groups = self.groups_of(id);
        for group in &groups {
            if let Some(g) = self.groups.get_mut(group) {
                g.members.remove(&id);
            }
        }
        self.memberships.remove(&id);

        let mut keys: BTreeSet<EdgeKey> = BTreeSet::new();
        keys.extend(self.outgoing.get(&id).into_iter().flatten().cloned());
        keys.extend(self.incoming.get(&id).into_iter().flatten().cloned());
        for key in &keys {
            self.remove_edge(key);
        }
        self.levels.remove(&id);

        CascadeReport {
            groups_left: groups.len(),
            edges_removed: keys.len(),
            ..CascadeReport::default()
        }
    }

    /// Destroy `id` and clean up after it, applying the registry's
    /// [`CascadePolicy`] to its children.
    ///
    /// Everything is checked before the first change is made.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::NotFound`] or [`EntityError::InvalidStatus`] if
    /// `id` is unknown or already destroyed.
    pub fn destroy_entity(
        &mut self,
        registry: &mut EntityRegistry,
        id: EntityId,
    ) -> Result<CascadeReport, EntityError> {
        let record = registry.get(id)?;
        if record.is_destroyed() {
            return Err(EntityError::InvalidStatus {
                entity: id,
                status: record.status,
                operation: "destroy",
            });
        }
        let parent = record.parent_id;
        let children: Vec<EntityId> = record.children.iter().copied().collect();
        let policy = registry.config().cascade;

        let mut targets = vec![id];
        if policy == CascadePolicy::Destroy {
            targets.extend(
                self.descendants(registry, id)?
                    .into_iter()
                    .filter(|d| registry.is_alive(*d)),
            );
        }

        self.invalidate_levels(registry, id);
        if let Some(parent) = parent
            && registry.is_alive(parent)
        {
            registry.modify(parent, |r| {
                r.children.remove(&id);
            })?;
            registry.modify(id, |r| r.parent_id = None)?;
        }

        let mut report = CascadeReport::default();
        if policy == CascadePolicy::Orphan {
            for child in children {
                registry.modify(child, |r| r.parent_id = None)?;
                report.orphaned.push(child);
            }
            if !report.orphaned.is_empty() {
                registry.modify(id, |r| r.children.clear())?;
            }
        }

        for target in targets {
            registry.destroy(target)?;
            let cascade = self.cascade_destroy(target);
            report.groups_left += cascade.groups_left;
            report.edges_removed += cascade.edges_removed;
            report.destroyed.push(target);
        }
        debug!(
            entity = %id,
            destroyed = report.destroyed.len(),
            orphaned = report.orphaned.len(),
            edges = report.edges_removed,
            "destroyed entity with cascade"
        );
        Ok(report)
    }

    /// Replace all groups and edges, as after a restore.
    pub fn restore(&mut self, groups: Vec<Group>, edges: Vec<Edge>) {
        *self = Self::default();
        for group in groups {
            for member in &group.members {
                self.memberships
                    .entry(*member)
                    .or_default()
                    .insert(group.id.clone());
            }
            self.groups.insert(group.id.clone(), group);
        }
        for edge in edges {
            let key = (edge.from, edge.to, edge.kind.clone());
            self.outgoing.entry(edge.from).or_default().insert(key.clone());
            self.incoming.entry(edge.to).or_default().insert(key.clone());
            self.edges.insert(key, edge);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::registry::{CreateOptions, RegistryConfig};

    fn make_world(n: usize) -> (EntityRegistry, Relationships, Vec<EntityId>) {
        make_world_with(RegistryConfig::default(), n)
    }

    fn make_world_with(
        config: RegistryConfig,
        n: usize,
    ) -> (EntityRegistry, Relationships, Vec<EntityId>) {
        let mut registry = EntityRegistry::new(config);
        let ids = (0..n).map(|_| registry.create(CreateOptions::new())).collect();
        (registry, Relationships::new(), ids)
    }

    #[test]
    fn test_add_child_rejects_cycles() {
        let (mut registry, mut rel, ids) = make_world(2);
        let (a, b) = (ids[0], ids[1]);
        rel.add_child(&mut registry, a, b).unwrap();
        let before = registry.records();

        assert_eq!(
            rel.add_child(&mut registry, b, a),
            Err(EntityError::HierarchyCycle { parent: b, child: a })
        );
        assert_eq!(
            rel.add_child(&mut registry, a, a),
            Err(EntityError::SelfParent(a))
        );
        assert_eq!(registry.records(), before);
    }

    #[test]
    fn test_hierarchy_walks_and_levels() {
        let (mut registry, mut rel, ids) = make_world(4);
        rel.add_child(&mut registry, ids[0], ids[1]).unwrap();
        rel.add_child(&mut registry, ids[1], ids[2]).unwrap();
        rel.add_child(&mut registry, ids[0], ids[3]).unwrap();

        assert_eq!(rel.ancestors(&registry, ids[2]).unwrap(), vec![ids[1], ids[0]]);
        assert_eq!(
            rel.descendants(&registry, ids[0]).unwrap(),
            vec![ids[1], ids[3], ids[2]]
        );
        assert_eq!(rel.hierarchy_level(&registry, ids[0]).unwrap(), 0);
        assert_eq!(rel.hierarchy_level(&registry, ids[2]).unwrap(), 2);

        // Re-parenting invalidates the cached depth of the whole subtree.
        rel.add_child(&mut registry, ids[3], ids[1]).unwrap();
        assert_eq!(rel.hierarchy_level(&registry, ids[2]).unwrap(), 3);
        assert_eq!(
            rel.hierarchy_level(&registry, ids[2]).unwrap(),
            rel.ancestors(&registry, ids[2]).unwrap().len()
        );
        assert!(!registry.get(ids[0]).unwrap().children.contains(&ids[1]));
    }

    #[test]
    fn test_hierarchy_changes_bump_versions() {
        let (mut registry, mut rel, ids) = make_world(2);
        rel.add_child(&mut registry, ids[0], ids[1]).unwrap();
        rel.remove_child(&mut registry, ids[0], ids[1]).unwrap();
        assert_eq!(registry.get(ids[0]).unwrap().version, 3);
        assert_eq!(registry.get(ids[1]).unwrap().version, 3);
        assert_eq!(
            rel.remove_child(&mut registry, ids[0], ids[1]),
            Err(EntityError::NotChild {
                parent: ids[0],
                child: ids[1]
            })
        );
    }

    #[test]
    fn test_groups() {
        let (registry, mut rel, ids) = make_world(2);
        rel.create_group(Group::new("squad", "Alpha").with_owner(ids[0]).with_type("party"))
            .unwrap();
        assert!(matches!(
            rel.create_group(Group::new("squad", "Again")),
            Err(EntityError::DuplicateGroup(_))
        ));

        rel.add_to_group(&registry, "squad", ids[0]).unwrap();
        rel.add_to_group(&registry, "squad", ids[1]).unwrap();
        assert_eq!(rel.groups_of(ids[1]), vec!["squad"]);
        assert!(matches!(
            rel.add_to_group(&registry, "nope", ids[0]),
            Err(EntityError::GroupNotFound(_))
        ));
        assert!(matches!(
            rel.add_to_group(&registry, "squad", EntityId::from_raw(99)),
            Err(EntityError::NotFound(_))
        ));

        rel.remove_from_group("squad", ids[1]).unwrap();
        assert!(matches!(
            rel.remove_from_group("squad", ids[1]),
            Err(EntityError::NotMember { .. })
        ));

        let deleted = rel.delete_group("squad").unwrap();
        assert_eq!(deleted.members.len(), 1);
        assert!(rel.groups_of(ids[0]).is_empty());
    }

    #[test]
    fn test_typed_edges() {
        let (registry, mut rel, ids) = make_world(3);
        rel.add_relationship(&registry, ids[0], ids[1], "targets", json!({"priority": 1}))
            .unwrap();
        rel.add_relationship(&registry, ids[2], ids[1], "targets", Value::Null)
            .unwrap();
        rel.add_relationship(&registry, ids[0], ids[2], "follows", Value::Null)
            .unwrap();

        assert!(rel.has_relationship(ids[0], ids[1], "targets"));
        assert!(!rel.has_relationship(ids[1], ids[0], "targets"));
        assert_eq!(rel.relationships_from(ids[0]).len(), 2);
        assert_eq!(rel.relationships_to(ids[1]).len(), 2);
        assert_eq!(rel.relationships_of_type("follows").len(), 1);

        rel.remove_relationship(ids[0], ids[2], "follows").unwrap();
        assert!(matches!(
            rel.remove_relationship(ids[0], ids[2], "follows"),
            Err(EntityError::RelationshipNotFound { .. })
        ));
    }

    #[test]
    fn test_destroy_cascades_subtree() {
        let (mut registry, mut rel, ids) = make_world(4);
        rel.add_child(&mut registry, ids[0], ids[1]).unwrap();
        rel.add_child(&mut registry, ids[1], ids[2]).unwrap();
        rel.create_group(Group::new("g", "G")).unwrap();
        rel.add_to_group(&registry, "g", ids[2]).unwrap();
        rel.add_relationship(&registry, ids[3], ids[2], "targets", Value::Null)
            .unwrap();

        let report = rel.destroy_entity(&mut registry, ids[0]).unwrap();
        assert_eq!(report.destroyed, vec![ids[0], ids[1], ids[2]]);
        assert_eq!(report.groups_left, 1);
        assert_eq!(report.edges_removed, 1);
        assert!(registry.is_alive(ids[3]));
        assert!(rel.group("g").unwrap().members.is_empty());
        assert!(rel.relationships_from(ids[3]).is_empty());
    }

    #[test]
    fn test_destroy_orphans_children() {
        let config = RegistryConfig::default().with_cascade(CascadePolicy::Orphan);
        let (mut registry, mut rel, ids) = make_world_with(config, 3);
        rel.add_child(&mut registry, ids[0], ids[1]).unwrap();
        rel.add_child(&mut registry, ids[1], ids[2]).unwrap();

        let report = rel.destroy_entity(&mut registry, ids[1]).unwrap();
        assert_eq!(report.destroyed, vec![ids[1]]);
        assert_eq!(report.orphaned, vec![ids[2]]);
        assert_eq!(registry.get(ids[2]).unwrap().parent_id, None);
        assert!(registry.get(ids[0]).unwrap().children.is_empty());
        assert_eq!(rel.hierarchy_level(&registry, ids[2]).unwrap(), 0);
        assert!(rel.destroy_entity(&mut registry, ids[1]).is_err());
    }
}
