//! Table backups.
//!
//! A [`Backup`] is one self-contained record holding the full row list of
//! every backed-up table together with the options needed to recreate it.
//! Backups are encoded as MessagePack so they can be shipped to files or a
//! persistence bridge as a single blob.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StorageError;
use crate::table::{RowKey, TableKind, TableOptions};

/// A snapshot of one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableBackup {
    pub name: String,
    pub kind: TableKind,
    pub options: TableOptions,
    /// Every row in the table at backup time.
    pub data: Vec<(RowKey, Value)>,
    pub metadata: Value,
}

/// A snapshot of a set of tables owned by one manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    pub timestamp: DateTime<Utc>,
    pub manager_name: String,
    pub tables: Vec<TableBackup>,
}

impl Backup {
    /// Returns the backed-up table with the given name.
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&TableBackup> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Total number of rows across all tables.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.tables.iter().map(|t| t.data.len()).sum()
    }

    /// Keep only the named tables.
    #[must_use]
    pub fn retain_tables(mut self, names: &[&str]) -> Self {
        self.tables.retain(|t| names.contains(&t.name.as_str()));
        self
    }

    /// Encode the backup to MessagePack bytes.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Encode`] if serialisation fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StorageError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Decode a backup from MessagePack bytes.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Decode`] if the bytes are not a valid backup.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Write the encoded backup to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if encoding or writing fails.
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<(), StorageError> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    /// Read and decode a backup from `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if reading or decoding fails.
    pub fn read_from(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::from_bytes(&std::fs::read(path)?)
    }
}

/// Outcome of [`TableManager::restore`](crate::TableManager::restore).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Names of the tables that were recreated.
    pub tables: Vec<String>,
    /// Total rows reinserted.
    pub rows: usize,
}
