//! # engine_component
//!
//! The "C" in ECS. Defines what a component is, how its data is validated
//! and how entities are identified.
//!
//! This crate provides:
//!
//! - [`EntityId`] — opaque entity identifiers (sequential or UUID based).
//! - [`EntityIdAllocator`] — allocates ids according to an [`IdStrategy`].
//! - [`ComponentType`] — runtime metadata and validator for a component type.
//! - [`FieldSchema`] / [`FieldType`] — the field schema component data is
//!   checked against.
//! - [`ComponentQuery`] — required / optional / excluded component sets used
//!   by systems to select entities.

pub mod component;
pub mod entity;
pub mod error;
pub mod query;
pub mod schema;

pub use component::{ComponentData, ComponentDescriptor, ComponentType, Validator};
pub use entity::{EntityId, EntityIdAllocator, IdStrategy};
pub use error::SchemaError;
pub use query::ComponentQuery;
pub use schema::{FieldSchema, FieldType};
