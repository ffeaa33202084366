//! Primary synchronous key-value store.
//!
//! Small, capacity-limited, immediate. Holds scalar slots, their backup
//! slots, and the legacy mirrors of record-store collections.

mod file;
mod memory;

pub use file::FileKvStore;
pub use memory::MemoryKvStore;

use crate::error::{CacheError, Result};
use std::collections::BTreeMap;

/// Synchronous string key-value storage.
pub trait KvStore: Send + Sync {
    /// Read a raw value.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a raw value. Fails with `QuotaExceeded` when the store is full.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a key. Returns whether it existed.
    fn remove(&self, key: &str) -> Result<bool>;

    /// All keys, sorted.
    fn keys(&self) -> Result<Vec<String>>;

    /// Bytes currently used (keys plus values).
    fn used_bytes(&self) -> usize;

    /// Total capacity in bytes.
    fn capacity_bytes(&self) -> usize;
}

/// In-memory map with byte accounting, shared by both implementations.
#[derive(Clone, Debug, Default)]
pub(crate) struct KvMap {
    entries: BTreeMap<String, String>,
    used: usize,
    capacity: usize,
}

fn entry_size(key: &str, value: &str) -> usize {
    key.len() + value.len()
}

impl KvMap {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            used: 0,
            capacity,
        }
    }

    pub(crate) fn from_entries(entries: BTreeMap<String, String>, capacity: usize) -> Self {
        let used = entries.iter().map(|(k, v)| entry_size(k, v)).sum();
        Self {
            entries,
            used,
            capacity,
        }
    }

    pub(crate) fn entries(&self) -> &BTreeMap<String, String> {
        &self.entries
    }

    pub(crate) fn get(&self, key: &str) -> Option<&String> {
        self.entries.get(key)
    }

    /// Insert, returning the previous value. Nothing changes on quota failure.
    pub(crate) fn insert(&mut self, key: &str, value: &str) -> Result<Option<String>> {
        let old = self
            .entries
            .get(key)
            .map(|v| entry_size(key, v))
            .unwrap_or(0);
        let needed = entry_size(key, value);
        let projected = self.used - old + needed;

        if projected > self.capacity {
            return Err(CacheError::QuotaExceeded {
                key: key.to_string(),
                needed,
                capacity: self.capacity,
            });
        }

        self.used = projected;
        Ok(self.entries.insert(key.to_string(), value.to_string()))
    }

    /// Restore a previous value after a failed persist.
    pub(crate) fn restore(&mut self, key: &str, previous: Option<String>) {
        match previous {
            Some(v) => {
                let _ = self.insert(key, &v);
            }
            None => {
                self.remove(key);
            }
        }
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<String> {
        let removed = self.entries.remove(key)?;
        self.used -= entry_size(key, &removed);
        Some(removed)
    }

    pub(crate) fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub(crate) fn used(&self) -> usize {
        self.used
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}
