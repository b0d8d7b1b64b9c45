//! Component type metadata.
//!
//! A [`ComponentType`] describes one kind of component: its name, schema
//! version, field schema, which fields carry secondary indexes, whether it is
//! persisted, and an optional custom validator run after the schema check.
//!
//! Component types are produced by the declarative definition layer and fed
//! to storage initialisation; this crate only defines the runtime structure.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SchemaError;
use crate::schema::{FieldSchema, FieldType, validate_record};

/// Dynamically typed component data.
pub type ComponentData = Value;

/// A custom validator. Returns a human-readable reason on rejection.
pub type Validator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// The serialisable part of a [`ComponentType`].
///
/// Stored alongside table backups so a restored table can be re-registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentDescriptor {
    pub name: String,
    pub version: u32,
    pub fields: Vec<FieldSchema>,
    pub indexed: Vec<String>,
    pub persistent: bool,
    pub description: Option<String>,
}

/// Runtime metadata for a component type.
///
/// # Examples
///
/// ```rust
/// use engine_component::{ComponentType, FieldType};
/// use serde_json::json;
///
/// let health = ComponentType::new("health")
///     .field("current", FieldType::Float)
///     .field("max", FieldType::Float)
///     .indexed("max")
///     .with_validator(|v| match v["current"].as_f64() {
///         Some(c) if c < 0.0 => Err("health cannot be negative".into()),
///         _ => Ok(()),
///     });
///
/// assert!(health.validate(&json!({"current": 10.0, "max": 100.0})).is_ok());
/// assert!(health.validate(&json!({"current": -1.0, "max": 100.0})).is_err());
/// ```
#[derive(Clone)]
pub struct ComponentType {
    descriptor: ComponentDescriptor,
    validator: Option<Validator>,
}

impl ComponentType {
    /// Create a component type with no fields (a tag) at version 1.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            descriptor: ComponentDescriptor {
                name: name.into(),
                version: 1,
                fields: Vec::new(),
                indexed: Vec::new(),
                persistent: true,
                description: None,
            },
            validator: None,
        }
    }

    /// Rebuild a component type from its serialised descriptor. Custom
    /// validators are not serialisable and must be re-attached.
    #[must_use]
    pub fn from_descriptor(descriptor: ComponentDescriptor) -> Self {
        Self {
            descriptor,
            validator: None,
        }
    }

    /// Add a field to the schema.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.descriptor.fields.push(FieldSchema::new(name, ty));
        self
    }

    /// Maintain a secondary index on `field`.
    #[must_use]
    pub fn indexed(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        if !self.descriptor.indexed.contains(&field) {
            self.descriptor.indexed.push(field);
        }
        self
    }

    #[must_use]
    pub fn version(mut self, version: u32) -> Self {
        self.descriptor.version = version;
        self
    }

    #[must_use]
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.descriptor.persistent = persistent;
        self
    }

    #[must_use]
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.descriptor.description = Some(description.into());
        self
    }

    /// Attach a custom validator, run after the field schema check.
    #[must_use]
    pub fn with_validator<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    #[must_use]
    pub fn indexed_fields(&self) -> &[String] {
        &self.descriptor.indexed
    }

    #[must_use]
    pub fn is_persistent(&self) -> bool {
        self.descriptor.persistent
    }

    #[must_use]
    pub fn descriptor(&self) -> &ComponentDescriptor {
        &self.descriptor
    }

    /// Check `value` against the field schema and then the custom validator.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Validation`] if either check rejects the value.
    pub fn validate(&self, value: &Value) -> Result<(), SchemaError> {
        validate_record(&self.descriptor.name, &self.descriptor.fields, value)?;
        if let Some(validator) = &self.validator {
            validator(value).map_err(|msg| SchemaError::validation(self.name(), msg))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ComponentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentType")
            .field("descriptor", &self.descriptor)
            .field("validator", &self.validator.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn health() -> ComponentType {
        ComponentType::new("health")
            .field("current", FieldType::Float)
            .field("max", FieldType::Float)
            .indexed("max")
            .indexed("max")
    }

    #[test]
    fn test_builder_deduplicates_indexes() {
        assert_eq!(health().indexed_fields(), ["max".to_string()]);
        assert_eq!(health().descriptor().version, 1);
    }

    #[test]
    fn test_custom_validator_runs_after_schema() {
        let ty = health().with_validator(|v| {
            if v["current"].as_f64() > v["max"].as_f64() {
                Err("current exceeds max".into())
            } else {
                Ok(())
            }
        });
        assert!(ty.validate(&json!({"current": 5.0, "max": 10.0})).is_ok());
        let err = ty
            .validate(&json!({"current": 50.0, "max": 10.0}))
            .unwrap_err();
        assert_eq!(err, SchemaError::validation("health", "current exceeds max"));
    }

    #[test]
    fn test_descriptor_roundtrip_drops_validator() {
        let ty = health().with_validator(|_| Err("never".into()));
        let restored = ComponentType::from_descriptor(ty.descriptor().clone());
        assert!(restored
            .validate(&json!({"current": 1.0, "max": 2.0}))
            .is_ok());
    }
}
