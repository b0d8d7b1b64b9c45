//! Save/load facade over pluggable storage bridges.
//!
//! [`Persistence`] turns a [`SaveRequest`] into a world backup, wraps it in a
//! [`SavedSnapshot`] and hands the MessagePack blob to the
//! [`PersistenceBridge`] registered for the request's [`Target`]. Loading
//! reverses the process.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use engine_storage::{Backup, RestoreReport};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::PersistenceError;
use crate::world::{ARCHETYPE_TABLE, EDGE_TABLE, ENTITY_TABLE, GROUP_TABLE, World};

const SNAPSHOT_EXTENSION: &str = "bak";

/// Which tables a save writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaveType {
    /// Every persistent table.
    #[default]
    Full,
    /// Only tables touched since the previous save, plus the registry.
    Incremental,
    /// Every table, non-persistent ones included.
    Backup,
}

/// Where a snapshot is stored. Each target needs a [`PersistenceBridge`]
/// registered with [`Persistence::with_bridge`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Target {
    /// An external database; no bridge ships for it.
    Database,
    /// Files in a directory, see [`FileBridge`].
    File,
    /// Process memory, see [`MemoryBridge`].
    #[default]
    Memory,
}

/// How a loaded snapshot is applied to live state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestoreMode {
    /// Saved tables replace live ones.
    #[default]
    Replace,
    /// Saved rows are upserted into live state.
    Merge,
    /// Only the tables named in the filter are replaced.
    Selective,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaveRequest {
    pub save_type: SaveType,
    pub target: Target,
    /// Restrict the save to these component tables.
    pub include_components: Option<Vec<String>>,
    pub metadata: Map<String, Value>,
}

impl SaveRequest {
    #[must_use]
    pub fn new(save_type: SaveType, target: Target) -> Self {
        Self {
            save_type,
            target,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn including(mut self, component: impl Into<String>) -> Self {
        self.include_components
            .get_or_insert_with(Vec::new)
            .push(component.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadRequest {
    pub source: Target,
    /// Snapshot id; `None` loads the latest.
    pub version: Option<String>,
    /// Restrict the load to these tables.
    pub filter: Option<Vec<String>>,
    pub restore_mode: RestoreMode,
}

impl LoadRequest {
    #[must_use]
    pub fn new(source: Target) -> Self {
        Self {
            source,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    #[must_use]
    pub fn with_filter(mut self, table: impl Into<String>) -> Self {
        self.filter.get_or_insert_with(Vec::new).push(table.into());
        self
    }

    #[must_use]
    pub fn with_restore_mode(mut self, restore_mode: RestoreMode) -> Self {
        self.restore_mode = restore_mode;
        self
    }
}

/// The blob handed to a bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedSnapshot {
    pub id: String,
    pub save_type: SaveType,
    pub metadata: Map<String, Value>,
    pub saved_at: DateTime<Utc>,
    pub backup: Backup,
}

impl SavedSnapshot {
    /// # Errors
    ///
    /// Returns [`PersistenceError::Encode`] if serialisation fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PersistenceError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// # Errors
    ///
    /// Returns [`PersistenceError::Decode`] if the bytes are not a snapshot.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PersistenceError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveReceipt {
    pub id: String,
    pub target: Target,
    pub save_type: SaveType,
    pub tables: Vec<String>,
    pub rows: usize,
    pub bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub id: String,
    pub restore_mode: RestoreMode,
    pub restored: RestoreReport,
}

/// Stores and fetches snapshot blobs by id.
pub trait PersistenceBridge: Send + Sync + fmt::Debug {
    /// # Errors
    ///
    /// Returns an error if the blob could not be stored.
    fn store(&self, id: &str, blob: &[u8]) -> Result<(), PersistenceError>;

    /// Fetch the blob with `id`, or the latest one when `id` is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::NotFound`] if there is no such blob.
    fn fetch(&self, id: Option<&str>) -> Result<(String, Vec<u8>), PersistenceError>;

    /// Stored ids, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be listed.
    fn list(&self) -> Result<Vec<String>, PersistenceError>;
}

/// Keeps blobs in memory.
#[derive(Debug, Default)]
pub struct MemoryBridge {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBridge {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistenceBridge for MemoryBridge {
    fn store(&self, id: &str, blob: &[u8]) -> Result<(), PersistenceError> {
        self.blobs.lock().insert(id.to_string(), blob.to_vec());
        Ok(())
    }

    fn fetch(&self, id: Option<&str>) -> Result<(String, Vec<u8>), PersistenceError> {
        let blobs = self.blobs.lock();
        let found = match id {
            Some(id) => blobs.get_key_value(id),
            None => blobs.last_key_value(),
        };
        found
            .map(|(id, blob)| (id.clone(), blob.clone()))
            .ok_or_else(|| PersistenceError::NotFound(id.unwrap_or("latest").to_string()))
    }

    fn list(&self) -> Result<Vec<String>, PersistenceError> {
        Ok(self.blobs.lock().keys().cloned().collect())
    }
}

/// Keeps blobs as `<id>.bak` files in a directory.
#[derive(Debug, Clone)]
pub struct FileBridge {
    dir: PathBuf,
}

impl FileBridge {
    /// Creates `dir` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Io`] if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{SNAPSHOT_EXTENSION}"))
    }
}

impl PersistenceBridge for FileBridge {
    fn store(&self, id: &str, blob: &[u8]) -> Result<(), PersistenceError> {
        let tmp = self.dir.join(format!("{id}.tmp"));
        fs::write(&tmp, blob)?;
        fs::rename(&tmp, self.path(id))?;
        debug!(path = %self.path(id).display(), bytes = blob.len(), "wrote snapshot");
        Ok(())
    }

    fn fetch(&self, id: Option<&str>) -> Result<(String, Vec<u8>), PersistenceError> {
        let id = match id {
            Some(id) => id.to_string(),
            None => self
                .list()?
                .pop()
                .ok_or_else(|| PersistenceError::NotFound("latest".to_string()))?,
        };
        match fs::read(self.path(&id)) {
            Ok(blob) => Ok((id, blob)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(PersistenceError::NotFound(id))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn list(&self) -> Result<Vec<String>, PersistenceError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == SNAPSHOT_EXTENSION)
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Save/load facade for a [`World`].
#[derive(Debug)]
pub struct Persistence {
    world: Arc<World>,
    bridges: HashMap<Target, Arc<dyn PersistenceBridge>>,
    /// Table access counts at the previous save.
    saved_access: Mutex<HashMap<String, u64>>,
}

impl Persistence {
    #[must_use]
    pub fn new(world: Arc<World>) -> Self {
        Self {
            world,
            bridges: HashMap::new(),
            saved_access: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_bridge(mut self, target: Target, bridge: Arc<dyn PersistenceBridge>) -> Self {
        self.bridges.insert(target, bridge);
        self
    }

    fn bridge(&self, target: Target) -> Result<&Arc<dyn PersistenceBridge>, PersistenceError> {
        self.bridges
            .get(&target)
            .ok_or(PersistenceError::Unsupported(target))
    }

    /// Snapshot ids stored under `target`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Unsupported`] if no bridge is configured.
    pub fn list(&self, target: Target) -> Result<Vec<String>, PersistenceError> {
        self.bridge(target)?.list()
    }

    /// Take a snapshot and store it through the target's bridge.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Unsupported`] if no bridge is configured
    /// for the target, or the underlying backup, encode or bridge error.
    pub fn save(&self, request: SaveRequest) -> Result<SaveReceipt, PersistenceError> {
        let bridge = self.bridge(request.target)?;

        let mut backup = match (&request.include_components, request.save_type) {
            (Some(components), _) => {
                let names: Vec<&str> = components.iter().map(String::as_str).collect();
                self.world.backup_components(&names)?
            }
            (None, SaveType::Backup) => self.world.backup_all()?,
            (None, _) => self.world.backup()?,
        };

        let current: HashMap<String, u64> = self
            .world
            .tables()
            .all_stats()
            .into_iter()
            .map(|s| (s.name, s.access_count))
            .collect();
        {
            let mut saved = self.saved_access.lock();
            if request.save_type == SaveType::Incremental {
                backup.tables.retain(|t| {
                    is_snapshot_table(&t.name) || saved.get(&t.name) != current.get(&t.name)
                });
            }
            // Tables left out of this snapshot still count as unsaved.
            for table in &backup.tables {
                if let Some(count) = current.get(&table.name) {
                    saved.insert(table.name.clone(), *count);
                }
            }
        }

        let snapshot = SavedSnapshot {
            id: Uuid::now_v7().to_string(),
            save_type: request.save_type,
            metadata: request.metadata,
            saved_at: Utc::now(),
            backup,
        };
        let blob = snapshot.to_bytes()?;
        bridge.store(&snapshot.id, &blob)?;

        let receipt = SaveReceipt {
            id: snapshot.id,
            target: request.target,
            save_type: request.save_type,
            tables: snapshot.backup.tables.iter().map(|t| t.name.clone()).collect(),
            rows: snapshot.backup.row_count(),
            bytes: blob.len(),
        };
        info!(
            id = %receipt.id,
            target = ?receipt.target,
            save_type = ?receipt.save_type,
            tables = receipt.tables.len(),
            rows = receipt.rows,
            "saved snapshot"
        );
        Ok(receipt)
    }

    /// Fetch a snapshot and apply it to the world.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::InvalidRequest`] for a selective load
    /// without a filter, [`PersistenceError::Unsupported`] if no bridge is
    /// configured, [`PersistenceError::NotFound`] for an unknown version, or
    /// the underlying decode or restore error.
    pub fn load(&self, request: LoadRequest) -> Result<LoadReport, PersistenceError> {
        if request.restore_mode == RestoreMode::Selective && request.filter.is_none() {
            return Err(PersistenceError::InvalidRequest(
                "selective restore requires a filter".to_string(),
            ));
        }
        let (id, blob) = self
            .bridge(request.source)?
            .fetch(request.version.as_deref())?;
        let snapshot = SavedSnapshot::from_bytes(&blob)?;

        let mut backup = snapshot.backup;
        if let Some(filter) = &request.filter {
            let mut names: Vec<&str> = filter.iter().map(String::as_str).collect();
            if request.restore_mode != RestoreMode::Selective {
                names.extend([ENTITY_TABLE, EDGE_TABLE, GROUP_TABLE, ARCHETYPE_TABLE]);
            }
            backup = backup.retain_tables(&names);
        }

        let restored = match request.restore_mode {
            RestoreMode::Merge => self.world.merge(&backup)?,
            RestoreMode::Replace | RestoreMode::Selective => self.world.restore(&backup)?,
        };
        info!(
            id = %id,
            mode = ?request.restore_mode,
            tables = restored.tables.len(),
            rows = restored.rows,
            "loaded snapshot"
        );
        Ok(LoadReport {
            id,
            restore_mode: request.restore_mode,
            restored,
        })
    }
}

fn is_snapshot_table(name: &str) -> bool {
    [ENTITY_TABLE, EDGE_TABLE, GROUP_TABLE, ARCHETYPE_TABLE].contains(&name)
}
