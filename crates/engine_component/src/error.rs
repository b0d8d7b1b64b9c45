//! Component-layer error types.

/// Errors raised while validating component data or parsing component-level
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    /// Component data failed its schema or custom validator.
    #[error("validation error on '{component}': {message}")]
    Validation {
        /// The component type being validated.
        component: String,
        /// Human-readable reason for the rejection.
        message: String,
    },

    /// An id strategy name could not be parsed.
    #[error("unknown id strategy: {0}")]
    UnknownIdStrategy(String),
}

impl SchemaError {
    /// Shorthand for a [`SchemaError::Validation`].
    #[must_use]
    pub fn validation(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            component: component.into(),
            message: message.into(),
        }
    }
}
