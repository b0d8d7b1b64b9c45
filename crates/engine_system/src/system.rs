//! The system contract.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use engine_component::{ComponentQuery, EntityId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::trace;

use crate::config::SystemConfig;
use crate::context::SystemContext;
use crate::error::SystemError;

/// A system's private state, threaded through every run.
pub type SystemState = Value;

/// Scheduling priority. Lower variants run first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
    Idle,
}

impl Priority {
    pub const ALL: [Self; 5] = [
        Self::Critical,
        Self::High,
        Self::Medium,
        Self::Low,
        Self::Idle,
    ];

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Idle => "idle",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.label().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown priority: {s}"))
    }
}

/// Why a system is being terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminateReason {
    /// The owning scheduler or pipeline is shutting down.
    Shutdown,
    /// The system was unregistered.
    Unregistered,
    /// The system could not continue.
    Failed(String),
}

/// A unit of game logic.
///
/// Systems are shared between the scheduler and pipelines behind `Arc`, so
/// every hook takes `&self` and threads its mutable state through
/// [`SystemState`] instead. Only [`name`](System::name) is required; every
/// other hook has a no-op default.
pub trait System: Send + Sync + 'static {
    /// Stable name the system is registered under.
    fn name(&self) -> &str;

    fn priority(&self) -> Priority {
        Priority::Medium
    }

    /// Which entities the system runs over.
    fn query(&self) -> ComponentQuery {
        ComponentQuery::new()
    }

    /// Component types an entity must hold to be processed.
    fn required_components(&self) -> Vec<String> {
        self.query().required
    }

    /// Run every `n` ticks; `None` runs every tick.
    fn run_interval(&self) -> Option<u64> {
        None
    }

    /// Produce the initial state.
    ///
    /// # Errors
    ///
    /// An error keeps the system from being registered.
    fn init(&self, config: &SystemConfig) -> Result<SystemState, SystemError> {
        Ok(Value::Object(config.settings.clone()))
    }

    /// Checked every time the system is due; `false` skips this run.
    fn should_run(&self, _ctx: &SystemContext, _state: &SystemState) -> bool {
        true
    }

    /// # Errors
    ///
    /// An error fails this run.
    fn before_execute(
        &self,
        _ctx: &mut SystemContext,
        state: SystemState,
    ) -> Result<SystemState, SystemError> {
        Ok(state)
    }

    /// Run over `entities`, returning the new state.
    ///
    /// The default folds [`process_entity`](System::process_entity) over
    /// every entity with the components [`query`](System::query) reads.
    ///
    /// # Errors
    ///
    /// An error fails this run and the previous state is kept.
    fn execute(
        &self,
        ctx: &mut SystemContext,
        entities: &[EntityId],
        state: SystemState,
    ) -> Result<SystemState, SystemError> {
        let query = self.query();
        entities.iter().try_fold(state, |state, &entity| {
            let components = ctx.components(entity, &query);
            self.process_entity(ctx, entity, &components, state)
        })
    }

    /// # Errors
    ///
    /// An error stops the run at this entity.
    fn process_entity(
        &self,
        _ctx: &mut SystemContext,
        _entity: EntityId,
        _components: &BTreeMap<String, Value>,
        state: SystemState,
    ) -> Result<SystemState, SystemError> {
        Ok(state)
    }

    /// # Errors
    ///
    /// An error fails this run.
    fn after_execute(
        &self,
        _ctx: &mut SystemContext,
        state: SystemState,
    ) -> Result<SystemState, SystemError> {
        Ok(state)
    }

    /// Called once when the system is removed.
    fn terminate(&self, _reason: &TerminateReason, _state: &SystemState) {}
}

/// Runs the before / execute / after sequence once.
///
/// # Errors
///
/// Returns the first hook error.
pub fn run_once(
    system: &dyn System,
    ctx: &mut SystemContext,
    entities: &[EntityId],
    state: SystemState,
) -> Result<SystemState, SystemError> {
    trace!(
        system = system.name(),
        tick_id = ctx.tick_id,
        entities = entities.len(),
        "running system"
    );
    let state = system.before_execute(ctx, state)?;
    let state = system.execute(ctx, entities, state)?;
    system.after_execute(ctx, state)
}

/// An empty state object.
#[must_use]
pub fn empty_state() -> SystemState {
    Value::Object(Map::new())
}
