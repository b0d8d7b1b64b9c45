//! Entity-layer error types.

use engine_component::EntityId;

use crate::record::EntityStatus;
use crate::registry::EntityHandle;

/// Errors raised by the registry, relationships and archetype resolver.
///
/// Every operation that fails leaves the prior state untouched.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EntityError {
    /// No entity with this id exists.
    #[error("{0} not found")]
    NotFound(EntityId),

    /// The handle points at a slot that has since been reused or reactivated.
    #[error("stale handle (slot {}, generation {})", .0.slot, .0.generation)]
    StaleHandle(EntityHandle),

    /// The operation is not allowed from the entity's current status.
    #[error("cannot {operation} {entity} while {status}")]
    InvalidStatus {
        entity: EntityId,
        status: EntityStatus,
        operation: &'static str,
    },

    /// An entity cannot be its own parent.
    #[error("{0} cannot be its own parent")]
    SelfParent(EntityId),

    /// Making `child` a child of `parent` would create a cycle.
    #[error("{child} is an ancestor of {parent}")]
    HierarchyCycle { parent: EntityId, child: EntityId },

    /// `child` is not a child of `parent`.
    #[error("{child} is not a child of {parent}")]
    NotChild { parent: EntityId, child: EntityId },

    #[error("group '{0}' not found")]
    GroupNotFound(String),

    #[error("group '{0}' already exists")]
    DuplicateGroup(String),

    #[error("{entity} is not a member of group '{group}'")]
    NotMember { group: String, entity: EntityId },

    #[error("no '{kind}' relationship from {from} to {to}")]
    RelationshipNotFound {
        from: EntityId,
        to: EntityId,
        kind: String,
    },

    #[error("archetype '{0}' not found")]
    ArchetypeNotFound(String),

    #[error("archetype '{0}' already exists")]
    DuplicateArchetype(String),

    /// The parent chain of an archetype would loop back on itself.
    #[error("archetype '{0}' would inherit from itself")]
    ArchetypeCycle(String),

    /// Other archetypes still inherit from this one.
    #[error("archetype '{name}' is the parent of {children:?}")]
    ArchetypeInUse { name: String, children: Vec<String> },

    #[error("archetype '{archetype}' has no variation '{variation}'")]
    UnknownVariation {
        archetype: String,
        variation: String,
    },

    /// A spawn tried to exclude a required component.
    #[error("component '{component}' is required by archetype '{archetype}'")]
    RequiredComponent {
        archetype: String,
        component: String,
    },
}
