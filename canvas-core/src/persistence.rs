//! Key/value persistence backends for the state store.
//!
//! The store writes one key per namespace, `{persistence_key}.{namespace}`.
//! Backends are synchronous; a failed call is logged and counted by the
//! store while the in-memory state stays authoritative.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::{CanvasError, CanvasResult};

/// Synchronous key/value storage.
pub trait PersistenceBackend: Send + Sync + std::fmt::Debug {
    /// Store a value under a key.
    ///
    /// # Errors
    ///
    /// Returns an error if the value could not be written.
    fn save(&self, key: &str, value: &str) -> CanvasResult<()>;

    /// Load the value stored under a key.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend could not be read.
    fn load(&self, key: &str) -> CanvasResult<Option<String>>;

    /// Delete a key. Deleting a missing key succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the key could not be removed.
    fn remove(&self, key: &str) -> CanvasResult<()>;
}

/// Process-local backend, mainly for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryPersistence {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut keys: Vec<_> = entries.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl PersistenceBackend for MemoryPersistence {
    fn save(&self, key: &str, value: &str) -> CanvasResult<()> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn load(&self, key: &str) -> CanvasResult<Option<String>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn remove(&self, key: &str) -> CanvasResult<()> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

/// Backend writing one JSON file per key into a data directory.
#[derive(Debug, Clone)]
pub struct FilePersistence {
    data_dir: PathBuf,
}

impl FilePersistence {
    /// Create a backend rooted at `data_dir`, creating the directory.
    ///
    /// # Errors
    ///
    /// Returns [`CanvasError::Io`] if the directory cannot be created.
    pub fn new(data_dir: impl Into<PathBuf>) -> CanvasResult<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;
        Ok(Self { data_dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.data_dir.join(format!("{}.json", sanitize_filename(key)))
    }
}

impl PersistenceBackend for FilePersistence {
    fn save(&self, key: &str, value: &str) -> CanvasResult<()> {
        let path = self.path_for(key);
        std::fs::write(&path, value).map_err(|e| {
            CanvasError::Persistence(format!("failed to write {}: {e}", path.display()))
        })
    }

    fn load(&self, key: &str) -> CanvasResult<Option<String>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(std::fs::read_to_string(&path)?))
    }

    fn remove(&self, key: &str) -> CanvasResult<()> {
        let path = self.path_for(key);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}

/// Sanitize a storage key for use as a filename.
///
/// Replaces any character that is not alphanumeric, `-`, or `_` with `_`.
fn sanitize_filename(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
