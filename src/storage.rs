//! Session-scoped key/value storage.
//!
//! Carries in-flight authorization state across the redirect to the
//! authorization server and back. Nothing here outlives a `clear()`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt storage file: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Storage lock poisoned")]
    Poisoned,
}

/// Session storage seen by the launch pipeline
pub trait SessionStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
    /// Remove every entry
    fn clear(&self) -> Result<(), StoreError>;
}

fn lock(entries: &Mutex<HashMap<String, String>>) -> Result<MutexGuard<'_, HashMap<String, String>>, StoreError> {
    entries.lock().map_err(|_| StoreError::Poisoned)
}

/// In-process store, lost when the process exits
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(lock(&self.entries)?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        lock(&self.entries)?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        lock(&self.entries)?.remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        lock(&self.entries)?.clear();
        Ok(())
    }
}

/// JSON-file store shared by consecutive CLI runs of the same launch.
///
/// Every mutation is written through to disk; `clear()` deletes the file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl FileStore {
    /// Open the store at `path`, loading existing entries if the file exists
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let entries: HashMap<String, String> = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)?
        } else {
            HashMap::new()
        };
        debug!("Opened session store at {:?} ({} entries)", path, entries.len());

        Ok(Self {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
        })
    }

    fn persist(&self, entries: &HashMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(entries)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

impl SessionStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(lock(&self.entries)?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = lock(&self.entries)?;
        entries.insert(key.to_string(), value.to_string());
        self.persist(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = lock(&self.entries)?;
        if entries.remove(key).is_some() {
            self.persist(&entries)?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut entries = lock(&self.entries)?;
        entries.clear();
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
            debug!("Deleted session store {:?}", self.path);
        }
        Ok(())
    }
}
