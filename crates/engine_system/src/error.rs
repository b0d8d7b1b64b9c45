//! System-layer error types.

use engine_component::EntityId;
use engine_entity::EntityError;
use engine_storage::StorageError;

/// Errors raised by a system's hooks.
#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    /// `init` refused to start the system.
    #[error("system '{system}' failed to initialise: {reason}")]
    InitFailed { system: String, reason: String },

    /// `execute` or one of its hooks failed.
    #[error("system '{system}' failed: {reason}")]
    ExecutionFailed { system: String, reason: String },

    /// The system panicked while running.
    #[error("system '{system}' panicked: {message}")]
    Panicked { system: String, message: String },

    /// The run was cancelled, for example after a timeout, and the write
    /// was refused.
    #[error("write of '{component}' on {entity} refused: run cancelled")]
    Cancelled { entity: EntityId, component: String },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Entity(#[from] EntityError),
}

impl SystemError {
    /// Shorthand for a [`SystemError::ExecutionFailed`].
    #[must_use]
    pub fn failed(system: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            system: system.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`SystemError::InitFailed`].
    #[must_use]
    pub fn init_failed(system: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InitFailed {
            system: system.into(),
            reason: reason.into(),
        }
    }
}
