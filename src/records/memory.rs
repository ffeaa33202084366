//! In-memory record store.

use super::{dedupe, upsert, validate_collection_name, RecordStore, StoredRecord};
use crate::error::{CacheError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Volatile record store. Can be switched unavailable to exercise
/// degraded-mode paths.
pub struct MemoryRecordStore {
    collections: RwLock<HashMap<String, Vec<StoredRecord>>>,
    unavailable: AtomicBool,
    /// Successful mutating calls.
    writes: AtomicU64,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
            writes: AtomicU64::new(0),
        }
    }

    /// Make every subsequent call fail with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of successful mutating calls so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn check(&self, collection: &str) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("memory record store offline".into()));
        }
        validate_collection_name(collection)
    }

    fn wrote(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore for MemoryRecordStore {
    fn get_all(&self, collection: &str) -> Result<Vec<StoredRecord>> {
        self.check(collection)?;
        Ok(self
            .collections
            .read()
            .get(collection)
            .cloned()
            .unwrap_or_default())
    }

    fn get(&self, collection: &str, id: &str) -> Result<Option<StoredRecord>> {
        self.check(collection)?;
        Ok(self
            .collections
            .read()
            .get(collection)
            .and_then(|records| records.iter().find(|r| r.id == id).cloned()))
    }

    fn put(&self, collection: &str, record: StoredRecord) -> Result<()> {
        self.check(collection)?;
        let mut collections = self.collections.write();
        upsert(collections.entry(collection.to_string()).or_default(), record);
        self.wrote();
        Ok(())
    }

    fn replace_all(&self, collection: &str, records: Vec<StoredRecord>) -> Result<()> {
        self.check(collection)?;
        let records = dedupe(collection, records);
        self.collections
            .write()
            .insert(collection.to_string(), records);
        self.wrote();
        Ok(())
    }

    fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        self.check(collection)?;
        let mut collections = self.collections.write();
        let Some(records) = collections.get_mut(collection) else {
            return Ok(false);
        };
        let before = records.len();
        records.retain(|r| r.id != id);
        let removed = records.len() != before;
        if removed {
            self.wrote();
        }
        Ok(removed)
    }

    fn clear(&self, collection: &str) -> Result<()> {
        self.check(collection)?;
        self.collections.write().remove(collection);
        self.wrote();
        Ok(())
    }

    fn count(&self, collection: &str) -> Result<usize> {
        self.check(collection)?;
        Ok(self
            .collections
            .read()
            .get(collection)
            .map(Vec::len)
            .unwrap_or(0))
    }

    fn collections(&self) -> Result<Vec<String>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("memory record store offline".into()));
        }
        let mut names: Vec<String> = self
            .collections
            .read()
            .iter()
            .filter(|(_, records)| !records.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_crud() {
        let store = MemoryRecordStore::new();
        store.put("tasks", StoredRecord::new("t1", json!({"id": "t1"}))).unwrap();
        store.put("tasks", StoredRecord::new("t2", json!({"id": "t2"}))).unwrap();

        assert_eq!(store.count("tasks").unwrap(), 2);
        assert!(store.get("tasks", "t2").unwrap().is_some());
        assert!(store.delete("tasks", "t1").unwrap());
        assert!(!store.delete("tasks", "t1").unwrap());
        assert_eq!(store.collections().unwrap(), vec!["tasks".to_string()]);

        store.clear("tasks").unwrap();
        assert!(store.get_all("tasks").unwrap().is_empty());
        assert!(store.collections().unwrap().is_empty());
    }

    #[test]
    fn test_unavailable() {
        let store = MemoryRecordStore::new();
        store.set_unavailable(true);
        assert!(matches!(store.get_all("tasks"), Err(CacheError::Unavailable(_))));
        store.set_unavailable(false);
        assert!(store.get_all("tasks").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_collection_is_empty() {
        let store = MemoryRecordStore::new();
        assert_eq!(store.count("nothing").unwrap(), 0);
        assert!(store.get("nothing", "x").unwrap().is_none());
    }
}
