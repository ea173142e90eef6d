//! Local persistent key-value storage
//!
//! The local store is synchronous and capacity-bounded. Writers must treat
//! `StoreError::QuotaExceeded` as an expected outcome: the sync engine degrades
//! its payload and retries instead of failing.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::errors::{Result, StoreError};

/// Current space accounting of a local store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StorageUsage {
    /// Bytes used by keys and values
    pub used_bytes: usize,
    /// Declared capacity, if the store is bounded
    pub quota_bytes: Option<usize>,
    /// Number of stored keys
    pub keys: usize,
}

impl StorageUsage {
    /// Fraction of the quota in use, if the store is bounded
    pub fn utilization(&self) -> Option<f64> {
        self.quota_bytes.map(|quota| {
            if quota == 0 {
                1.0
            } else {
                self.used_bytes as f64 / quota as f64
            }
        })
    }
}

/// Synchronous string key-value storage with a finite quota
pub trait LocalStore: Send + Sync {
    /// Read a value
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, failing with `QuotaExceeded` when it does not fit
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a value; removing a missing key is not an error
    fn remove(&self, key: &str) -> Result<()>;

    /// All keys currently stored
    fn keys(&self) -> Result<Vec<String>>;

    /// Remove every key
    fn clear(&self) -> Result<()>;

    /// Space accounting
    fn usage(&self) -> StorageUsage;
}

/// JSON helpers available on every local store
pub trait LocalStoreExt: LocalStore {
    /// Read and decode a JSON value
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Encode and write a JSON value
    fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw)
    }
}

impl<S: LocalStore + ?Sized> LocalStoreExt for S {}

fn entry_size(key: &str, value: &str) -> usize {
    key.len() + value.len()
}

/// Entries plus running byte total, shared by both local store implementations
#[derive(Debug, Default, Clone)]
struct Entries {
    map: BTreeMap<String, String>,
    used: usize,
}

impl Entries {
    fn from_map(map: BTreeMap<String, String>) -> Self {
        let used = map.iter().map(|(k, v)| entry_size(k, v)).sum();
        Self { map, used }
    }

    /// Check that `key = value` fits, returning the resulting byte total
    fn check_fits(&self, key: &str, value: &str, quota: Option<usize>) -> Result<usize> {
        let previous = self.map.get(key).map(|v| entry_size(key, v)).unwrap_or(0);
        let needed = entry_size(key, value);
        let after = self.used - previous + needed;

        if let Some(quota) = quota {
            if after > quota {
                return Err(StoreError::QuotaExceeded {
                    key: key.to_string(),
                    needed,
                    available: quota.saturating_sub(self.used - previous),
                });
            }
        }

        Ok(after)
    }

    fn insert(&mut self, key: &str, value: &str, after: usize) {
        self.map.insert(key.to_string(), value.to_string());
        self.used = after;
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.map.remove(key) {
            Some(old) => {
                self.used -= entry_size(key, &old);
                true
            }
            None => false,
        }
    }

    fn usage(&self, quota: Option<usize>) -> StorageUsage {
        StorageUsage {
            used_bytes: self.used,
            quota_bytes: quota,
            keys: self.map.len(),
        }
    }
}

fn lock(entries: &Mutex<Entries>) -> MutexGuard<'_, Entries> {
    entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-process local store with an optional byte quota
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<Entries>,
    quota: Option<usize>,
}

impl MemoryStore {
    /// Create an unbounded store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that rejects writes past `quota_bytes`
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            quota: Some(quota_bytes),
        }
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(lock(&self.entries).map.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = lock(&self.entries);
        let after = entries.check_fits(key, value, self.quota)?;
        entries.insert(key, value, after);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        lock(&self.entries).remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(lock(&self.entries).map.keys().cloned().collect())
    }

    fn clear(&self) -> Result<()> {
        *lock(&self.entries) = Entries::default();
        Ok(())
    }

    fn usage(&self) -> StorageUsage {
        lock(&self.entries).usage(self.quota)
    }
}

/// Local store persisted as a single JSON document
///
/// Every mutation rewrites the document through a temporary file and an
/// atomic rename, so a crash leaves either the old or the new contents.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<Entries>,
    quota: Option<usize>,
}

impl FileStore {
    /// Open (or create) a store at `path`
    pub fn open(path: impl AsRef<Path>, quota_bytes: Option<usize>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let map = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<BTreeMap<String, String>>(&content) {
                Ok(map) => map,
                Err(e) => {
                    warn!(
                        "Local store {} is corrupted, starting empty: {}",
                        path.display(),
                        e
                    );
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };

        debug!("Opened local store {} ({} keys)", path.display(), map.len());

        Ok(Self {
            path,
            entries: Mutex::new(Entries::from_map(map)),
            quota: quota_bytes,
        })
    }

    /// Location of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, map: &BTreeMap<String, String>) -> Result<()> {
        let content = serde_json::to_string(map)?;
        let temp_path = self.path.with_extension("tmp");
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

impl LocalStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(lock(&self.entries).map.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = lock(&self.entries);
        let after = entries.check_fits(key, value, self.quota)?;

        let mut next = entries.clone();
        next.insert(key, value, after);
        self.persist(&next.map)?;

        *entries = next;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = lock(&self.entries);
        if !entries.map.contains_key(key) {
            return Ok(());
        }

        let mut next = entries.clone();
        next.remove(key);
        self.persist(&next.map)?;

        *entries = next;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(lock(&self.entries).map.keys().cloned().collect())
    }

    fn clear(&self) -> Result<()> {
        let mut entries = lock(&self.entries);
        self.persist(&BTreeMap::new())?;
        *entries = Entries::default();
        Ok(())
    }

    fn usage(&self) -> StorageUsage {
        lock(&self.entries).usage(self.quota)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_store_quota() {
        let store = MemoryStore::with_quota(20);
        store.set("a", "0123456789").unwrap();

        let err = store.set("b", "0123456789").unwrap_err();
        assert!(err.is_quota_exceeded());

        // Overwriting an existing key only counts the difference
        store.set("a", "01234567890123456").unwrap();
        assert_eq!(store.usage().used_bytes, 18);
        assert_eq!(store.get("b").unwrap(), None);
    }

    #[test]
    fn test_memory_store_remove_and_clear() {
        let store = MemoryStore::new();
        store.set("a", "1").unwrap();
        store.set("b", "2").unwrap();

        store.remove("a").unwrap();
        store.remove("missing").unwrap();
        assert_eq!(store.keys().unwrap(), vec!["b".to_string()]);

        store.clear().unwrap();
        assert_eq!(store.usage(), StorageUsage::default());
    }

    #[test]
    fn test_json_helpers() {
        let store = MemoryStore::new();
        store.set_json("numbers", &vec![1, 2, 3]).unwrap();

        let numbers: Vec<u32> = store.get_json("numbers").unwrap().unwrap();
        assert_eq!(numbers, vec![1, 2, 3]);

        store.set("broken", "{not json").unwrap();
        assert!(store.get_json::<Vec<u32>>("broken").is_err());
        assert!(store.get_json::<Vec<u32>>("missing").unwrap().is_none());
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("local.json");

        {
            let store = FileStore::open(&path, None).unwrap();
            store.set("marker", "on").unwrap();
            store.set("other", "x").unwrap();
            store.remove("other").unwrap();
        }

        let reopened = FileStore::open(&path, None).unwrap();
        assert_eq!(reopened.get("marker").unwrap(), Some("on".to_string()));
        assert_eq!(reopened.get("other").unwrap(), None);
    }

    #[test]
    fn test_file_store_corrupted_file_loads_empty() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("local.json");
        std::fs::write(&path, "garbage").unwrap();

        let store = FileStore::open(&path, Some(1024)).unwrap();
        assert!(store.keys().unwrap().is_empty());

        store.set("k", "v").unwrap();
        assert_eq!(store.usage().quota_bytes, Some(1024));
    }

    #[test]
    fn test_file_store_quota_leaves_file_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("local.json");

        let store = FileStore::open(&path, Some(10)).unwrap();
        store.set("k", "v").unwrap();
        assert!(store.set("big", "0123456789").is_err());

        let reopened = FileStore::open(&path, Some(10)).unwrap();
        assert_eq!(reopened.keys().unwrap(), vec!["k".to_string()]);
    }
}
