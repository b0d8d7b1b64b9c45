//! # engine_entity
//!
//! Entity lifecycle and structure for the ECS server core.
//!
//! This crate provides:
//!
//! - [`EntityRegistry`] — the canonical metadata record of every entity,
//!   stored in a generational arena with status/archetype/tag indexes,
//!   paginated filtering and garbage collection of destroyed entities.
//! - [`Relationships`] — the parent/child hierarchy, named groups and typed
//!   edges between entities, with cascading cleanup on destruction.
//! - [`ArchetypeResolver`] — named component templates with single-parent
//!   inheritance, materialized into concrete components at spawn time.

pub mod archetype;
pub mod error;
pub mod record;
pub mod registry;
pub mod relationship;

pub use archetype::{
    Archetype, ArchetypeComponent, ArchetypeResolver, Materialized, ResolvedArchetype,
    SpawnConfig, SpawnOptions, VariationSets,
};
pub use error::EntityError;
pub use record::{EntityChanges, EntityRecord, EntityStatus, LifecycleEvent};
pub use registry::{
    CascadePolicy, CreateOptions, EntityFilter, EntityHandle, EntityRegistry, Page, PageResult,
    RegistryConfig, RegistryStats,
};
pub use relationship::{CascadeReport, Edge, Group, Relationships};
