//! Concurrent key/value tables and the manager that owns them.
//!
//! A [`Table`] maps a [`RowKey`] (usually an entity id) to a JSON value and
//! can be read and written from many threads at once. The [`TableManager`]
//! owns a named set of tables, independent of whichever system happens to be
//! using them, and can back them up and restore them as a whole.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use engine_component::EntityId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::backup::{Backup, RestoreReport, TableBackup};
use crate::error::StorageError;

/// A row key. Component tables are keyed by entity; auxiliary tables may use
/// plain names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RowKey {
    Entity(EntityId),
    Name(String),
}

impl RowKey {
    /// Returns the entity id if this key addresses an entity.
    #[must_use]
    pub fn as_entity(&self) -> Option<EntityId> {
        match self {
            Self::Entity(id) => Some(*id),
            Self::Name(_) => None,
        }
    }
}

impl From<EntityId> for RowKey {
    fn from(id: EntityId) -> Self {
        Self::Entity(id)
    }
}

impl From<&str> for RowKey {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for RowKey {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

/// How a table orders its rows when listed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableKind {
    /// Unordered.
    #[default]
    Set,
    /// Listed in ascending key order.
    OrderedSet,
}

/// Creation options for a table. Recorded in backups so a restore can
/// recreate the table exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableOptions {
    pub kind: TableKind,
    /// Free-form name of the subsystem owning the table.
    pub owner: String,
    /// Non-persistent tables are skipped by full backups.
    pub persistent: bool,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            kind: TableKind::Set,
            owner: "unowned".to_string(),
            persistent: true,
        }
    }
}

impl TableOptions {
    #[must_use]
    pub fn with_kind(mut self, kind: TableKind) -> Self {
        self.kind = kind;
        self
    }

    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    #[must_use]
    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }
}

/// Point-in-time statistics for a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableStats {
    pub name: String,
    pub kind: TableKind,
    /// Number of rows.
    pub size: usize,
    /// Approximate payload size in bytes.
    pub memory: usize,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    /// Number of row reads and writes since creation.
    pub access_count: u64,
}

/// A concurrent key/value table.
#[derive(Debug)]
pub struct Table {
    name: String,
    options: TableOptions,
    rows: DashMap<RowKey, Value>,
    created_at: DateTime<Utc>,
    access_count: AtomicU64,
    metadata: RwLock<Value>,
}

impl Table {
    fn new(name: String, options: TableOptions) -> Self {
        Self {
            name,
            options,
            rows: DashMap::new(),
            created_at: Utc::now(),
            access_count: AtomicU64::new(0),
            metadata: RwLock::new(Value::Null),
        }
    }

    fn touch(&self) {
        self.access_count.fetch_add(1, Ordering::Relaxed);
    }

    /// The name the table was created under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kind, owner and persistence flag, fixed at creation.
    #[must_use]
    pub fn options(&self) -> &TableOptions {
        &self.options
    }

    /// Returns a copy of the row at `key`.
    #[must_use]
    pub fn get(&self, key: &RowKey) -> Option<Value> {
        self.touch();
        self.rows.get(key).map(|row| row.value().clone())
    }

    /// Like [`Table::get`] but not counted as an access.
    pub(crate) fn peek(&self, key: &RowKey) -> Option<Value> {
        self.rows.get(key).map(|row| row.value().clone())
    }

    /// `true` if a row exists at `key`. Not counted as an access.
    #[must_use]
    pub fn contains(&self, key: &RowKey) -> bool {
        self.rows.contains_key(key)
    }

    /// Inserts or replaces a row, returning the previous value.
    pub fn insert(&self, key: RowKey, value: Value) -> Option<Value> {
        self.touch();
        self.rows.insert(key, value)
    }

    /// Removes a row, returning its value.
    pub fn remove(&self, key: &RowKey) -> Option<Value> {
        self.touch();
        self.rows.remove(key).map(|(_, value)| value)
    }

    /// Applies `f` to the row at `key` while holding the row's lock.
    ///
    /// Returns `false` if the row does not exist.
    pub fn update_with(&self, key: &RowKey, f: impl FnOnce(&mut Value)) -> bool {
        self.touch();
        match self.rows.get_mut(key) {
            Some(mut row) => {
                f(row.value_mut());
                true
            }
            None => false,
        }
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Returns all keys, sorted for [`TableKind::OrderedSet`].
    #[must_use]
    pub fn keys(&self) -> Vec<RowKey> {
        let mut keys: Vec<RowKey> = self.rows.iter().map(|row| row.key().clone()).collect();
        if self.options.kind == TableKind::OrderedSet {
            keys.sort();
        }
        keys
    }

    /// Returns every entity id with a row in this table.
    #[must_use]
    pub fn entity_keys(&self) -> Vec<EntityId> {
        self.rows
            .iter()
            .filter_map(|row| row.key().as_entity())
            .collect()
    }

    /// Returns a copy of every row, sorted for [`TableKind::OrderedSet`].
    #[must_use]
    pub fn rows(&self) -> Vec<(RowKey, Value)> {
        let mut rows: Vec<(RowKey, Value)> = self
            .rows
            .iter()
            .map(|row| (row.key().clone(), row.value().clone()))
            .collect();
        if self.options.kind == TableKind::OrderedSet {
            rows.sort_by(|a, b| a.0.cmp(&b.0));
        }
        rows
    }

    /// Removes every row. Metadata and the access count are kept.
    pub fn clear(&self) {
        self.rows.clear();
    }

    /// Free-form metadata stored with the table and its backups.
    #[must_use]
    pub fn metadata(&self) -> Value {
        self.metadata.read().clone()
    }

    /// Replaces the table metadata.
    pub fn set_metadata(&self, metadata: Value) {
        *self.metadata.write() = metadata;
    }

    /// Approximate payload size: the JSON-encoded length of every row.
    #[must_use]
    pub fn memory(&self) -> usize {
        self.rows
            .iter()
            .map(|row| {
                std::mem::size_of::<RowKey>()
                    + serde_json::to_vec(row.value()).map_or(0, |bytes| bytes.len())
            })
            .sum()
    }

    /// Size, memory and access statistics as of now.
    #[must_use]
    pub fn stats(&self) -> TableStats {
        TableStats {
            name: self.name.clone(),
            kind: self.options.kind,
            size: self.len(),
            memory: self.memory(),
            owner: self.options.owner.clone(),
            created_at: self.created_at,
            access_count: self.access_count.load(Ordering::Relaxed),
        }
    }
}

/// Owns a named collection of tables.
#[derive(Debug)]
pub struct TableManager {
    name: String,
    tables: DashMap<String, Arc<Table>>,
}

impl TableManager {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: DashMap::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create a new, empty table.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::DuplicateTable`] if the name is taken.
    pub fn create_table(
        &self,
        name: impl Into<String>,
        options: TableOptions,
    ) -> Result<Arc<Table>, StorageError> {
        let name = name.into();
        match self.tables.entry(name.clone()) {
            Entry::Occupied(_) => Err(StorageError::DuplicateTable(name)),
            Entry::Vacant(slot) => {
                let table = Arc::new(Table::new(name.clone(), options));
                slot.insert(Arc::clone(&table));
                info!(manager = %self.name, table = %name, "created table");
                Ok(table)
            }
        }
    }

    /// Delete a table and all its rows.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::TableMissing`] if no such table exists.
    pub fn delete_table(&self, name: &str) -> Result<(), StorageError> {
        self.tables
            .remove(name)
            .ok_or_else(|| StorageError::TableMissing(name.to_string()))?;
        info!(manager = %self.name, table = name, "deleted table");
        Ok(())
    }

    /// Look up a table by name.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::TableMissing`] if no such table exists.
    pub fn table(&self, name: &str) -> Result<Arc<Table>, StorageError> {
        self.tables
            .get(name)
            .map(|t| Arc::clone(t.value()))
            .ok_or_else(|| StorageError::TableMissing(name.to_string()))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Returns table names in ascending order.
    #[must_use]
    pub fn list_tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.iter().map(|t| t.key().clone()).collect();
        names.sort();
        names
    }

    /// Statistics for one table.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::TableMissing`] if no such table exists.
    pub fn stats(&self, name: &str) -> Result<TableStats, StorageError> {
        Ok(self.table(name)?.stats())
    }

    /// Statistics for every table, ordered by name.
    #[must_use]
    pub fn all_stats(&self) -> Vec<TableStats> {
        let mut stats: Vec<TableStats> = self.tables.iter().map(|t| t.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Back up every persistent table.
    #[must_use]
    pub fn backup(&self) -> Backup {
        let names: Vec<String> = self
            .list_tables()
            .into_iter()
            .filter(|name| {
                self.tables
                    .get(name)
                    .is_some_and(|t| t.options().persistent)
            })
            .collect();
        self.backup_snapshot(&names)
    }

    /// Back up the named tables only.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::TableMissing`] if any named table is missing.
    pub fn backup_tables(&self, names: &[&str]) -> Result<Backup, StorageError> {
        for name in names {
            if !self.contains(name) {
                return Err(StorageError::TableMissing((*name).to_string()));
            }
        }
        let names: Vec<String> = names.iter().map(|n| (*n).to_string()).collect();
        Ok(self.backup_snapshot(&names))
    }

    fn backup_snapshot(&self, names: &[String]) -> Backup {
        let tables: Vec<TableBackup> = names
            .iter()
            .filter_map(|name| self.tables.get(name).map(|t| Arc::clone(t.value())))
            .map(|table| TableBackup {
                name: table.name().to_string(),
                kind: table.options().kind,
                options: table.options().clone(),
                data: table.rows(),
                metadata: table.metadata(),
            })
            .collect();

        let rows: usize = tables.iter().map(|t| t.data.len()).sum();
        info!(
            manager = %self.name,
            tables = tables.len(),
            rows,
            "created backup"
        );

        Backup {
            timestamp: Utc::now(),
            manager_name: self.name.clone(),
            tables,
        }
    }

    /// Restore every table in `backup`.
    ///
    /// Each table is recreated from its recorded options, replacing any
    /// existing table of the same name, and its rows are bulk-inserted.
    /// Tables not mentioned in the backup are left alone.
    pub fn restore(&self, backup: &Backup) -> RestoreReport {
        let mut report = RestoreReport::default();
        for saved in &backup.tables {
            let table = Arc::new(Table::new(saved.name.clone(), saved.options.clone()));
            for (key, value) in &saved.data {
                table.rows.insert(key.clone(), value.clone());
            }
            table.set_metadata(saved.metadata.clone());
            self.tables.insert(saved.name.clone(), table);

            debug!(table = %saved.name, rows = saved.data.len(), "restored table");
            report.tables.push(saved.name.clone());
            report.rows += saved.data.len();
        }
        info!(
            manager = %self.name,
            source = %backup.manager_name,
            tables = report.tables.len(),
            rows = report.rows,
            "restored backup"
        );
        report
    }

    /// Drop every table.
    pub fn shutdown(&self) {
        let count = self.tables.len();
        self.tables.clear();
        info!(manager = %self.name, tables = count, "table manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn key(n: u64) -> RowKey {
        RowKey::Entity(EntityId::from_raw(n))
    }

    #[test]
    fn test_create_and_delete_table() {
        let manager = TableManager::new("test");
        manager
            .create_table("health", TableOptions::default())
            .unwrap();
        assert_eq!(manager.list_tables(), vec!["health"]);
        assert!(matches!(
            manager.create_table("health", TableOptions::default()),
            Err(StorageError::DuplicateTable(_))
        ));

        manager.delete_table("health").unwrap();
        assert!(manager.list_tables().is_empty());
        assert!(matches!(
            manager.delete_table("health"),
            Err(StorageError::TableMissing(_))
        ));
    }

    #[test]
    fn test_row_operations() {
        let manager = TableManager::new("test");
        let table = manager
            .create_table("health", TableOptions::default())
            .unwrap();

        assert_eq!(table.insert(key(1), json!({"hp": 10})), None);
        assert_eq!(table.get(&key(1)), Some(json!({"hp": 10})));
        assert!(table.update_with(&key(1), |v| v["hp"] = json!(5)));
        assert_eq!(table.get(&key(1)), Some(json!({"hp": 5})));
        assert!(!table.update_with(&key(2), |_| {}));
        assert_eq!(table.remove(&key(1)), Some(json!({"hp": 5})));
        assert!(table.is_empty());
    }

    #[test]
    fn test_ordered_set_lists_sorted() {
        let manager = TableManager::new("test");
        let table = manager
            .create_table(
                "names",
                TableOptions::default().with_kind(TableKind::OrderedSet),
            )
            .unwrap();
        for n in [5, 1, 3] {
            table.insert(key(n), json!(n));
        }
        assert_eq!(table.keys(), vec![key(1), key(3), key(5)]);
    }

    #[test]
    fn test_stats() {
        let manager = TableManager::new("test");
        let table = manager
            .create_table("health", TableOptions::default().with_owner("storage"))
            .unwrap();
        table.insert(key(1), json!({"hp": 10}));
        let _ = table.get(&key(1));

        let stats = manager.stats("health").unwrap();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.owner, "storage");
        assert_eq!(stats.access_count, 2);
        assert!(stats.memory > 0);
    }

    #[test]
    fn test_backup_skips_non_persistent_tables() {
        let manager = TableManager::new("test");
        manager
            .create_table("kept", TableOptions::default())
            .unwrap();
        manager
            .create_table("scratch", TableOptions::default().with_persistent(false))
            .unwrap();

        let backup = manager.backup();
        let names: Vec<_> = backup.tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["kept"]);
    }

    #[test]
    fn test_backup_restore_roundtrip() {
        let manager = TableManager::new("test");
        let table = manager
            .create_table("health", TableOptions::default().with_owner("storage"))
            .unwrap();
        table.set_metadata(json!({"version": 2}));
        table.insert(key(1), json!({"hp": 10}));
        table.insert(key(2), json!({"hp": 20}));

        let backup = manager.backup();
        manager.shutdown();
        assert!(manager.list_tables().is_empty());

        let report = manager.restore(&backup);
        assert_eq!(report.tables, vec!["health"]);
        assert_eq!(report.rows, 2);

        let restored = manager.table("health").unwrap();
        assert_eq!(restored.get(&key(2)), Some(json!({"hp": 20})));
        assert_eq!(restored.options().owner, "storage");
        assert_eq!(restored.metadata(), json!({"version": 2}));
    }

    #[test]
    fn test_partial_backup_requires_existing_tables() {
        let manager = TableManager::new("test");
        manager.create_table("a", TableOptions::default()).unwrap();
        assert!(manager.backup_tables(&["a"]).is_ok());
        assert!(matches!(
            manager.backup_tables(&["a", "b"]),
            Err(StorageError::TableMissing(name)) if name == "b"
        ));
    }
}
