//! # engine_storage
//!
//! Component storage for the ECS server core.
//!
//! This crate provides:
//!
//! - [`TableManager`] — a named collection of concurrent key/value [`Table`]s
//!   with create/delete/list/statistics and whole-table backup/restore.
//! - [`Backup`] — the self-contained, MessagePack-encoded backup blob.
//! - [`ComponentStore`] — schema-validated component reads and writes over
//!   the tables, with secondary indexes kept in step with every write and
//!   per-component performance counters.

pub mod backup;
pub mod error;
pub mod index;
pub mod stats;
pub mod store;
pub mod table;

pub use backup::{Backup, RestoreReport, TableBackup};
pub use error::StorageError;
pub use index::{FieldIndex, IndexKey};
pub use stats::{ComponentStats, OptimizeReport, PerformanceReport};
pub use store::ComponentStore;
pub use table::{RowKey, Table, TableKind, TableManager, TableOptions, TableStats};
