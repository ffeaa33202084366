//! In-memory synchronous store.

use super::{KvMap, KvStore};
use crate::error::Result;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default capacity, matching typical browser storage quotas.
const DEFAULT_CAPACITY: usize = 5 * 1024 * 1024;

/// Volatile key-value store with a byte quota.
pub struct MemoryKvStore {
    map: RwLock<KvMap>,
    /// Successful `set` calls.
    writes: AtomicU64,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            map: RwLock::new(KvMap::new(capacity)),
            writes: AtomicU64::new(0),
        }
    }

    /// Number of successful writes so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.map.write().insert(key, value)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.map.write().remove(key).is_some())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.map.read().keys())
    }

    fn used_bytes(&self) -> usize {
        self.map.read().used()
    }

    fn capacity_bytes(&self) -> usize {
        self.map.read().capacity()
    }
}
