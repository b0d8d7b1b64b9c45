//! Runtime field schema for component data.
//!
//! Component data is dynamically typed (`serde_json::Value`). A component
//! type declares its fields as a list of [`FieldSchema`]s and every write is
//! checked against them before it reaches storage.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SchemaError;

/// The declared type of a single component field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldType {
    Bool,
    Int,
    Float,
    String,
    /// A string (e.g. base64) or an array of byte values.
    Bytes,
    List(Box<FieldType>),
    Set(Box<FieldType>),
    Map(Box<FieldType>),
    Tuple(Vec<FieldType>),
    /// May be missing or `null`.
    Option(Box<FieldType>),
    /// Accepts any JSON value.
    Any,
}

/// A named field in a component schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    pub ty: FieldType,
}

impl FieldSchema {
    #[must_use]
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// Validate a component value against a list of fields.
///
/// A component with no fields is a tag and accepts `null` or an object.
///
/// # Errors
///
/// Returns [`SchemaError::Validation`] describing the first mismatch.
pub fn validate_record(
    component: &str,
    fields: &[FieldSchema],
    value: &Value,
) -> Result<(), SchemaError> {
    if fields.is_empty() {
        return match value {
            Value::Null | Value::Object(_) => Ok(()),
            _ => Err(SchemaError::validation(
                component,
                "tag component must be null or an object",
            )),
        };
    }

    let obj = value
        .as_object()
        .ok_or_else(|| SchemaError::validation(component, "expected JSON object"))?;

    for field in fields {
        match obj.get(&field.name) {
            Some(val) => validate_value(val, &field.ty).map_err(|msg| {
                SchemaError::validation(component, format!("field '{}': {msg}", field.name))
            })?,
            None if matches!(field.ty, FieldType::Option(_)) => {}
            None => {
                return Err(SchemaError::validation(
                    component,
                    format!("missing required field '{}'", field.name),
                ));
            }
        }
    }

    Ok(())
}

fn validate_value(value: &Value, ty: &FieldType) -> Result<(), String> {
    match ty {
        FieldType::Bool => {
            value.as_bool().ok_or("expected bool")?;
        }
        FieldType::Int => {
            if !(value.is_i64() || value.is_u64()) {
                return Err("expected integer".into());
            }
        }
        FieldType::Float => {
            value.as_f64().ok_or("expected number")?;
        }
        FieldType::String => {
            value.as_str().ok_or("expected string")?;
        }
        FieldType::Bytes => {
            if !value.is_string() && !value.is_array() {
                return Err("expected string or array for bytes".into());
            }
        }
        FieldType::List(inner) | FieldType::Set(inner) => {
            let items = value.as_array().ok_or("expected array")?;
            for (i, item) in items.iter().enumerate() {
                validate_value(item, inner).map_err(|e| format!("[{i}]: {e}"))?;
            }
        }
        FieldType::Map(inner) => {
            let entries = value.as_object().ok_or("expected object for map")?;
            for (key, item) in entries {
                validate_value(item, inner).map_err(|e| format!("[{key}]: {e}"))?;
            }
        }
        FieldType::Tuple(types) => {
            let arr = value.as_array().ok_or("expected array for tuple")?;
            if arr.len() != types.len() {
                return Err(format!(
                    "tuple has {} elements, expected {}",
                    arr.len(),
                    types.len()
                ));
            }
            for (item, ty) in arr.iter().zip(types) {
                validate_value(item, ty)?;
            }
        }
        FieldType::Option(inner) => {
            if !value.is_null() {
                validate_value(value, inner)?;
            }
        }
        FieldType::Any => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn transform_fields() -> Vec<FieldSchema> {
        vec![
            FieldSchema::new("x", FieldType::Float),
            FieldSchema::new("y", FieldType::Float),
            FieldSchema::new("label", FieldType::Option(Box::new(FieldType::String))),
        ]
    }

    #[test]
    fn test_valid_record() {
        let fields = transform_fields();
        assert!(validate_record("transform", &fields, &json!({"x": 1.0, "y": 2})).is_ok());
    }

    #[test]
    fn test_missing_required_field() {
        let fields = transform_fields();
        let err = validate_record("transform", &fields, &json!({"x": 1.0})).unwrap_err();
        assert_eq!(
            err,
            SchemaError::validation("transform", "missing required field 'y'")
        );
    }

    #[test]
    fn test_wrong_type_rejected() {
        let fields = transform_fields();
        assert!(validate_record("transform", &fields, &json!({"x": "a", "y": 1})).is_err());
        assert!(validate_record("transform", &fields, &json!([1, 2])).is_err());
    }

    #[test]
    fn test_tag_component() {
        assert!(validate_record("frozen", &[], &Value::Null).is_ok());
        assert!(validate_record("frozen", &[], &json!({})).is_ok());
        assert!(validate_record("frozen", &[], &json!(3)).is_err());
    }

    #[test]
    fn test_nested_list_elements_checked() {
        let fields = vec![FieldSchema::new(
            "slots",
            FieldType::List(Box::new(FieldType::Int)),
        )];
        assert!(validate_record("inventory", &fields, &json!({"slots": [1, 2]})).is_ok());
        assert!(validate_record("inventory", &fields, &json!({"slots": [1, 2.5]})).is_err());
    }

    #[test]
    fn test_tuple_arity() {
        let fields = vec![FieldSchema::new(
            "pos",
            FieldType::Tuple(vec![FieldType::Int, FieldType::Int]),
        )];
        assert!(validate_record("cell", &fields, &json!({"pos": [1, 2]})).is_ok());
        assert!(validate_record("cell", &fields, &json!({"pos": [1]})).is_err());
    }
}
