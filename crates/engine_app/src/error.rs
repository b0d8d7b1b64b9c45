//! Error types for the orchestration layer.

use std::time::Duration;

use engine_entity::EntityError;
use engine_storage::StorageError;
use engine_system::SystemError;

use crate::persistence::Target;

/// Errors raised by [`World`](crate::World) operations.
#[derive(Debug, thiserror::Error)]
pub enum WorldError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Entity(#[from] EntityError),

    /// A registry snapshot could not be converted to or from table rows.
    #[error("failed to convert snapshot rows: {0}")]
    Snapshot(#[from] serde_json::Error),
}

impl WorldError {
    /// Returns `true` for storage corruption rather than a bad request.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage(err) if err.is_fatal())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("system '{0}' is already registered")]
    DuplicateSystem(String),

    #[error("system '{0}' is not registered")]
    NotRegistered(String),

    /// `init` failed, so the system was not added.
    #[error("system '{system}' failed to initialise: {source}")]
    InitFailed {
        system: String,
        #[source]
        source: SystemError,
    },

    #[error("the tick loop is already running")]
    AlreadyRunning,
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("system '{0}' is already registered")]
    DuplicateSystem(String),

    #[error("system '{0}' is not registered")]
    NotRegistered(String),

    /// Registering would close a dependency cycle; nothing was changed.
    #[error("dependency cycle: {}", .path.join(" -> "))]
    DependencyCycle { path: Vec<String> },

    #[error("shared state key '{0}' not found")]
    StateNotFound(String),

    #[error("dependencies of '{system}' not ready after {after:?}: missing {missing:?}")]
    NotReady {
        system: String,
        missing: Vec<String>,
        after: Duration,
    },

    /// The recipient's mailbox is closed.
    #[error("could not deliver to '{0}'")]
    DeliveryFailed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("stage '{0}' already exists")]
    DuplicateStage(String),

    #[error("stage '{0}' not found")]
    UnknownStage(String),

    /// A system in the stage returned an error or panicked.
    #[error("stage '{stage}': {source}")]
    System {
        stage: String,
        #[source]
        source: SystemError,
    },

    /// A parallel system did not finish in time.
    #[error("stage '{stage}': system '{system}' timed out after {after:?}")]
    Timeout {
        stage: String,
        system: String,
        after: Duration,
    },

    /// A parallel system's task was lost.
    #[error("stage '{stage}': system '{system}' did not complete: {reason}")]
    Join {
        stage: String,
        system: String,
        reason: String,
    },

    /// The stage failed under the halt policy.
    #[error("pipeline halted at stage '{stage}'")]
    Halted {
        stage: String,
        #[source]
        source: Box<PipelineError>,
    },

    /// The stage failed on every attempt under the retry policy.
    #[error("stage '{stage}' failed after {attempts} attempts")]
    RetriesExhausted {
        stage: String,
        attempts: u32,
        #[source]
        source: Box<PipelineError>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// No bridge is configured for the target.
    #[error("no persistence bridge for target {0:?}")]
    Unsupported(Target),

    #[error("snapshot '{0}' not found")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    World(#[from] WorldError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("failed to decode snapshot: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment override could not be parsed.
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}
