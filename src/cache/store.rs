//! Key/value storage backing the coherence layer.
//!
//! `ContextStore`: durable storage private to one context (adopted token, entry snapshot).
//! `OriginStorage`: storage shared by every context of an origin, with change notifications
//! delivered to everyone except the writer.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

use crate::util::lock::{mutex_lock, rw_read, rw_write};

use super::events::ContextId;

const SOURCE: &str = "cache::store";
const CHANGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("storage quota exceeded writing `{key}`: needs {needed} bytes, {available} available")]
    QuotaExceeded {
        key: String,
        needed: usize,
        available: usize,
    },
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Durable per-context storage.
pub trait ContextStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Byte-bounded map shared by both storage kinds.
#[derive(Debug, Default)]
struct QuotaMap {
    entries: HashMap<String, String>,
    used: usize,
}

impl QuotaMap {
    fn insert(&mut self, key: &str, value: &str, quota: Option<usize>) -> Result<(), StoreError> {
        let released = self
            .entries
            .get(key)
            .map_or(0, |previous| key.len() + previous.len());
        let needed = key.len() + value.len();
        let used_after_release = self.used - released;
        if let Some(quota) = quota
            && used_after_release + needed > quota
        {
            return Err(StoreError::QuotaExceeded {
                key: key.to_string(),
                needed,
                available: quota.saturating_sub(used_after_release),
            });
        }

        self.entries.insert(key.to_string(), value.to_string());
        self.used = used_after_release + needed;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Option<String> {
        let removed = self.entries.remove(key)?;
        self.used -= key.len() + removed.len();
        Some(removed)
    }
}

/// In-memory `ContextStore`, optionally bounded by a byte quota.
#[derive(Debug, Default)]
pub struct MemoryContextStore {
    map: Mutex<QuotaMap>,
    quota: Option<usize>,
}

impl MemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota: usize) -> Self {
        Self {
            map: Mutex::new(QuotaMap::default()),
            quota: Some(quota),
        }
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.map, SOURCE, "len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ContextStore for MemoryContextStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(mutex_lock(&self.map, SOURCE, "get").entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        mutex_lock(&self.map, SOURCE, "set").insert(key, value, self.quota)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        mutex_lock(&self.map, SOURCE, "remove").remove(key);
        Ok(())
    }
}

/// Change observed on shared origin storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub key: String,
    pub new_value: Option<String>,
    pub writer: ContextId,
}

/// Storage shared by every context of one origin.
pub struct OriginStorage {
    map: RwLock<QuotaMap>,
    quota: Option<usize>,
    changes: broadcast::Sender<StorageChange>,
}

impl OriginStorage {
    pub fn new(quota: Option<usize>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            map: RwLock::new(QuotaMap::default()),
            quota,
            changes,
        }
    }

    pub fn read(&self, key: &str) -> Option<String> {
        rw_read(&self.map, SOURCE, "read").entries.get(key).cloned()
    }

    /// Write `value` under `key` and notify every listener.
    ///
    /// Listeners receive the writer id so a context can skip its own writes.
    pub fn write(&self, writer: ContextId, key: &str, value: &str) -> Result<(), StoreError> {
        rw_write(&self.map, SOURCE, "write").insert(key, value, self.quota)?;
        self.notify(StorageChange {
            key: key.to_string(),
            new_value: Some(value.to_string()),
            writer,
        });
        Ok(())
    }

    /// Write `value` only when `accept` approves the value currently stored under `key`.
    ///
    /// The check and the write happen under one lock. Returns whether the write happened.
    pub fn write_if<F>(
        &self,
        writer: ContextId,
        key: &str,
        value: &str,
        accept: F,
    ) -> Result<bool, StoreError>
    where
        F: FnOnce(Option<&str>) -> bool,
    {
        {
            let mut map = rw_write(&self.map, SOURCE, "write_if");
            if !accept(map.entries.get(key).map(String::as_str)) {
                return Ok(false);
            }
            map.insert(key, value, self.quota)?;
        }
        self.notify(StorageChange {
            key: key.to_string(),
            new_value: Some(value.to_string()),
            writer,
        });
        Ok(true)
    }

    pub fn remove(&self, writer: ContextId, key: &str) {
        if rw_write(&self.map, SOURCE, "remove").remove(key).is_some() {
            self.notify(StorageChange {
                key: key.to_string(),
                new_value: None,
                writer,
            });
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }

    fn notify(&self, change: StorageChange) {
        if self.changes.send(change).is_err() {
            debug!(target = SOURCE, "storage change had no listeners");
        }
    }
}

impl Default for OriginStorage {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_accounts_for_overwrites() {
        let store = MemoryContextStore::with_quota(16);
        store.set("k", "0123456789").expect("fits");
        store.set("k", "abcdefghij").expect("overwrite releases old bytes");

        let err = store.set("other", "0123456789").expect_err("quota exceeded");
        assert!(matches!(err, StoreError::QuotaExceeded { available: 5, .. }));

        store.remove("k").expect("remove");
        store.set("other", "0123456789").expect("fits after removal");
        assert_eq!(store.get("other").expect("get"), Some("0123456789".into()));
    }

    #[test]
    fn origin_storage_notifies_with_writer() {
        let storage = OriginStorage::default();
        let mut changes = storage.subscribe();
        let writer = ContextId::random();

        storage.write(writer, "gazette:coherence:articles", "{}").expect("write");

        let change = changes.try_recv().expect("change delivered");
        assert_eq!(change.writer, writer);
        assert_eq!(change.key, "gazette:coherence:articles");
        assert_eq!(storage.read("gazette:coherence:articles"), Some("{}".into()));
    }

    #[test]
    fn origin_storage_rejects_writes_over_quota() {
        let storage = OriginStorage::new(Some(8));
        let mut changes = storage.subscribe();

        let err = storage
            .write(ContextId::random(), "key", "far too long")
            .expect_err("quota");
        assert!(matches!(err, StoreError::QuotaExceeded { .. }));
        assert!(changes.try_recv().is_err());
    }
}
