//! Versioned flag store.
//!
//! Single source of truth for flag definitions: an in-memory map behind a
//! read-write lock with optional JSON snapshot persistence. Writes are
//! optimistic-concurrency-controlled; a stale `expected_version` is
//! rejected with `VersionConflict` so concurrent transition decisions
//! never silently clobber each other. There is no global write path:
//! contention is per-flag by construction of the version check.

use chrono::Utc;
use ramp_common::errors::StoreError;
use ramp_common::types::{FlagDefinition, FlagId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};

/// In-memory flag store with optional snapshot persistence.
pub struct FlagStore {
    flags: RwLock<HashMap<FlagId, FlagDefinition>>,
    /// Snapshot path. Writes are fire-and-forget; a failed snapshot is
    /// logged and the next successful write re-covers it.
    persist_path: Option<PathBuf>,
}

impl FlagStore {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self {
            flags: RwLock::new(HashMap::new()),
            persist_path: None,
        }
    }

    /// Enable snapshot persistence to the given path.
    pub fn with_persistence(mut self, path: PathBuf) -> Self {
        self.persist_path = Some(path);
        self
    }

    /// Load a store from a snapshot file written by [`FlagStore::with_persistence`].
    pub fn load_from_file(path: &Path) -> Result<Self, StoreError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Unavailable(format!("read {}: {e}", path.display())))?;
        let definitions: Vec<FlagDefinition> = serde_json::from_str(&raw)
            .map_err(|e| StoreError::Unavailable(format!("parse {}: {e}", path.display())))?;
        let flags = definitions
            .into_iter()
            .map(|def| (def.id.clone(), def))
            .collect::<HashMap<_, _>>();
        debug!("Loaded {} flags from {}", flags.len(), path.display());
        Ok(Self {
            flags: RwLock::new(flags),
            persist_path: Some(path.to_path_buf()),
        })
    }

    /// Fetch a definition by id.
    pub fn get(&self, id: &FlagId) -> Result<FlagDefinition, StoreError> {
        let flags = self.flags.read().unwrap_or_else(|e| e.into_inner());
        flags
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    /// Insert a brand-new definition. Rejects duplicates.
    pub fn create(&self, def: FlagDefinition) -> Result<FlagDefinition, StoreError> {
        {
            let mut flags = self.flags.write().unwrap_or_else(|e| e.into_inner());
            if flags.contains_key(&def.id) {
                return Err(StoreError::AlreadyExists(def.id));
            }
            flags.insert(def.id.clone(), def.clone());
        }
        self.persist();
        Ok(def)
    }

    /// Replace a definition, guarded by the caller's expected version.
    ///
    /// On success the stored version becomes `expected_version + 1` and
    /// `updated_at` is stamped. On mismatch nothing changes and the
    /// caller must re-read and retry.
    pub fn put(
        &self,
        id: &FlagId,
        expected_version: u64,
        mut def: FlagDefinition,
    ) -> Result<FlagDefinition, StoreError> {
        let stored = {
            let mut flags = self.flags.write().unwrap_or_else(|e| e.into_inner());
            let current = flags.get(id).ok_or_else(|| StoreError::NotFound(id.clone()))?;
            if current.version != expected_version {
                return Err(StoreError::VersionConflict {
                    flag: id.clone(),
                    expected: expected_version,
                    actual: current.version,
                });
            }
            def.version = expected_version + 1;
            def.updated_at = Utc::now();
            flags.insert(id.clone(), def.clone());
            def
        };
        self.persist();
        Ok(stored)
    }

    /// All definitions, optionally scoped to an environment. Used by the
    /// health monitor's scan loop.
    pub fn list(&self, environment: Option<&str>) -> Vec<FlagDefinition> {
        let flags = self.flags.read().unwrap_or_else(|e| e.into_inner());
        let mut definitions: Vec<FlagDefinition> = flags
            .values()
            .filter(|def| environment.is_none_or(|env| def.environment == env))
            .cloned()
            .collect();
        definitions.sort_by(|a, b| a.id.cmp(&b.id));
        definitions
    }

    pub fn len(&self) -> usize {
        self.flags.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Snapshot the full map to disk, fire-and-forget.
    fn persist(&self) {
        let Some(path) = self.persist_path.clone() else {
            return;
        };
        let definitions = self.list(None);
        tokio::spawn(async move {
            match serde_json::to_vec_pretty(&definitions) {
                Ok(bytes) => {
                    if let Err(e) = tokio::fs::write(&path, bytes).await {
                        warn!("Failed to persist flag store to {}: {}", path.display(), e);
                    }
                }
                Err(e) => warn!("Failed to serialize flag store snapshot: {}", e),
            }
        });
    }
}

impl Default for FlagStore {
    fn default() -> Self {
        Self::new()
    }
}
