//! Storage-layer error types.

use engine_component::{EntityId, SchemaError};

/// Errors that can occur during table and component operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Component data was rejected by its type's validator. Never retried.
    #[error("validation failed: {0}")]
    ValidationFailed(#[from] SchemaError),

    /// The entity holds no instance of the component type.
    #[error("component '{component}' not found on {entity}")]
    NotFound {
        /// The entity that was queried.
        entity: EntityId,
        /// The component type that was not found.
        component: String,
    },

    /// The backing table of a component type does not exist.
    #[error("table '{0}' is missing")]
    TableMissing(String),

    /// A table with this name already exists.
    #[error("table '{0}' already exists")]
    DuplicateTable(String),

    /// The component type was registered twice.
    #[error("component type '{0}' is already registered")]
    DuplicateComponent(String),

    /// `query_by_index` was called on a field without an index.
    #[error("field '{field}' of '{component}' is not indexed")]
    NotIndexed {
        /// The component type queried.
        component: String,
        /// The unindexed field.
        field: String,
    },

    /// A component descriptor could not be converted to table metadata.
    #[error("failed to encode component descriptor: {0}")]
    Descriptor(#[from] serde_json::Error),

    /// Failed to encode a backup to MessagePack.
    #[error("failed to encode backup: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Failed to decode a backup from MessagePack.
    #[error("failed to decode backup: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Reading or writing a backup file failed.
    #[error("backup I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Returns `true` for errors that indicate corrupted or incomplete
    /// storage rather than a bad request.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::TableMissing(_))
    }
}
