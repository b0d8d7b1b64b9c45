//! # engine_app
//!
//! Orchestration for the ECS server core.
//!
//! This crate provides:
//!
//! - [`World`] — one shared handle to tables, component storage, the entity
//!   registry, relationships and archetypes.
//! - [`Scheduler`] — runs registered systems by priority every tick, either
//!   manually or on a fixed-timestep [`TickLoop`].
//! - [`Coordinator`] — system dependency graph, shared state and
//!   point-to-point / topic messaging.
//! - [`Pipeline`] — ordered stages of systems with per-stage circuit
//!   breakers and error policies.
//! - [`Persistence`] — save/load requests delegated to a
//!   [`PersistenceBridge`].
//! - [`EngineConfig`] — all of the above, with environment overrides.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use engine_app::{Scheduler, SchedulerConfig, World};
//! use engine_component::{ComponentType, FieldType};
//! use engine_entity::CreateOptions;
//! use serde_json::json;
//!
//! let world = Arc::new(World::default());
//! world
//!     .register_component(ComponentType::new("health").field("hp", FieldType::Int))
//!     .unwrap();
//! let id = world.create(CreateOptions::new()).unwrap();
//! world.put_component(id, "health", json!({ "hp": 10 })).unwrap();
//!
//! let scheduler = Scheduler::new(Arc::clone(&world), SchedulerConfig::default());
//! assert_eq!(scheduler.tick().tick_id, 1);
//! ```

pub mod breaker;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod persistence;
pub mod pipeline;
pub mod scheduler;
pub mod tick;
pub mod world;

pub use breaker::{BreakerState, CircuitBreaker};
pub use config::EngineConfig;
pub use coordinator::{BroadcastReport, Coordinator, CoordinatorConfig, DependencyStatus, Message};
pub use error::{
    ConfigError, CoordinatorError, PersistenceError, PipelineError, SchedulerError, WorldError,
};
pub use metrics::WindowedRatio;
pub use persistence::{
    FileBridge, LoadReport, LoadRequest, MemoryBridge, Persistence, PersistenceBridge,
    RestoreMode, SaveReceipt, SaveRequest, SaveType, SavedSnapshot, Target,
};
pub use pipeline::{
    ErrorPolicy, Pipeline, PipelineRun, Stage, StageConfig, StageOutcome, StageStats,
    StageStatus, Transformer,
};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerStats, SystemStats, TickReport};
pub use tick::TickLoop;
pub use world::{World, WorldStats};
