//! # engine_system
//!
//! The contract every gameplay system implements, and what it is handed when
//! it runs.
//!
//! This crate provides:
//!
//! - [`System`] — the object-safe system trait with default no-op hooks.
//! - [`Priority`] — scheduling priority, `Critical` first.
//! - [`SystemConfig`] — per-system settings passed to [`System::init`].
//! - [`SystemContext`] — per-run tick metadata, component storage and read
//!   access to entity records and relationships.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use engine_component::{ComponentQuery, EntityId};
//! use engine_storage::{ComponentStore, TableManager};
//! use engine_system::{Priority, System, SystemContext, SystemError, SystemState};
//! use serde_json::{Value, json};
//!
//! struct Counter;
//!
//! impl System for Counter {
//!     fn name(&self) -> &str {
//!         "counter"
//!     }
//!
//!     fn priority(&self) -> Priority {
//!         Priority::Low
//!     }
//!
//!     fn query(&self) -> ComponentQuery {
//!         ComponentQuery::new().require("position")
//!     }
//!
//!     fn execute(
//!         &self,
//!         _ctx: &mut SystemContext,
//!         entities: &[EntityId],
//!         state: SystemState,
//!     ) -> Result<SystemState, SystemError> {
//!         let seen = state["seen"].as_u64().unwrap_or(0) + entities.len() as u64;
//!         Ok(json!({ "seen": seen }))
//!     }
//! }
//!
//! let store = Arc::new(ComponentStore::new(Arc::new(TableManager::new("demo"))));
//! let mut ctx = SystemContext::new(1, 1.0 / 60.0, store);
//! let state = Counter
//!     .execute(&mut ctx, &[EntityId::from_raw(1)], Value::Null)
//!     .unwrap();
//! assert_eq!(state["seen"], 1);
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod system;

pub use config::SystemConfig;
pub use context::SystemContext;
pub use error::SystemError;
pub use system::{Priority, System, SystemState, TerminateReason, empty_state, run_once};
