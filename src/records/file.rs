//! File-backed record store.

use super::{dedupe, upsert, validate_collection_name, RecordStore, StoredRecord};
use crate::error::Result;
use crate::frame::{acquire_lock, read_framed, write_framed};
use lru::LruCache;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Magic bytes for collection files.
const COLLECTION_MAGIC: &[u8; 4] = b"SRC\0";

/// Current collection format version.
const COLLECTION_VERSION: u8 = 1;

/// File extension for collection files.
const COLLECTION_EXT: &str = "rec";

/// One MessagePack-encoded file per collection.
pub struct FileRecordStore {
    /// Base directory for collection files.
    path: PathBuf,

    /// Lock file for exclusive access.
    _lock_file: File,

    /// LRU cache for recently accessed collections.
    cache: Mutex<LruCache<String, Vec<StoredRecord>>>,
}

impl FileRecordStore {
    /// Open the store at the given path, creating it if missing.
    pub fn open(path: impl AsRef<Path>, cache_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let lock_file = acquire_lock(&path)?;
        let cache_size = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            path,
            _lock_file: lock_file,
            cache: Mutex::new(LruCache::new(cache_size)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn collection_path(&self, collection: &str) -> PathBuf {
        self.path.join(format!("{}.{}", collection, COLLECTION_EXT))
    }

    fn load(&self, collection: &str) -> Result<Vec<StoredRecord>> {
        validate_collection_name(collection)?;

        // Check cache first
        if let Some(cached) = self.cache.lock().get(collection).cloned() {
            return Ok(cached);
        }

        let path = self.collection_path(collection);
        let records: Vec<StoredRecord> =
            match read_framed(&path, COLLECTION_MAGIC, COLLECTION_VERSION)? {
                Some(payload) => rmp_serde::from_slice(&payload)?,
                None => Vec::new(),
            };

        self.cache.lock().put(collection.to_string(), records.clone());
        Ok(records)
    }

    fn store(&self, collection: &str, records: Vec<StoredRecord>) -> Result<()> {
        validate_collection_name(collection)?;

        let path = self.collection_path(collection);
        if records.is_empty() {
            if path.exists() {
                fs::remove_file(&path)?;
            }
        } else {
            let payload = rmp_serde::to_vec_named(&records)?;
            write_framed(&path, COLLECTION_MAGIC, COLLECTION_VERSION, &payload)?;
        }

        debug!(collection = %collection, records = records.len(), "wrote collection");
        self.cache.lock().put(collection.to_string(), records);
        Ok(())
    }
}

impl RecordStore for FileRecordStore {
    fn get_all(&self, collection: &str) -> Result<Vec<StoredRecord>> {
        self.load(collection)
    }

    fn get(&self, collection: &str, id: &str) -> Result<Option<StoredRecord>> {
        Ok(self.load(collection)?.into_iter().find(|r| r.id == id))
    }

    fn put(&self, collection: &str, record: StoredRecord) -> Result<()> {
        let mut records = self.load(collection)?;
        upsert(&mut records, record);
        self.store(collection, records)
    }

    fn replace_all(&self, collection: &str, records: Vec<StoredRecord>) -> Result<()> {
        let records = dedupe(collection, records);
        self.store(collection, records)
    }

    fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let mut records = self.load(collection)?;
        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() == before {
            return Ok(false);
        }
        self.store(collection, records)?;
        Ok(true)
    }

    fn clear(&self, collection: &str) -> Result<()> {
        self.store(collection, Vec::new())
    }

    fn collections(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();

        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(COLLECTION_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }

        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample(n: usize) -> Vec<StoredRecord> {
        (0..n)
            .map(|i| {
                let id = format!("s{}", i);
                StoredRecord::new(id.clone(), json!({"id": id, "amount": i * 10, "tags": ["a"]}))
            })
            .collect()
    }

    #[test]
    fn test_store_and_reopen() {
        let dir = TempDir::new().unwrap();

        {
            let store = FileRecordStore::open(dir.path(), 4).unwrap();
            store.replace_all("sales_data", sample(12)).unwrap();
        }

        let store = FileRecordStore::open(dir.path(), 4).unwrap();
        let records = store.get_all("sales_data").unwrap();
        assert_eq!(records, sample(12));
        assert_eq!(store.collections().unwrap(), vec!["sales_data".to_string()]);
    }

    #[test]
    fn test_put_delete_clear() {
        let dir = TempDir::new().unwrap();
        let store = FileRecordStore::open(dir.path(), 4).unwrap();

        store.put("goals", StoredRecord::new("g1", json!({"id": "g1"}))).unwrap();
        store.put("goals", StoredRecord::new("g2", json!({"id": "g2"}))).unwrap();
        assert!(store.delete("goals", "g1").unwrap());
        assert_eq!(store.count("goals").unwrap(), 1);

        store.clear("goals").unwrap();
        assert!(store.collections().unwrap().is_empty());
        assert!(store.get_all("goals").unwrap().is_empty());
    }

    #[test]
    fn test_rejects_path_like_names() {
        let dir = TempDir::new().unwrap();
        let store = FileRecordStore::open(dir.path(), 4).unwrap();
        let err = store.get_all("../escape").unwrap_err();
        assert!(matches!(err, CacheError::InvalidKey(_)));
    }

    #[test]
    fn test_corrupt_collection_surfaces_error() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileRecordStore::open(dir.path(), 4).unwrap();
            store.replace_all("tasks", sample(3)).unwrap();
        }

        let path = dir.path().join("tasks.rec");
        let mut bytes = fs::read(&path).unwrap();
        bytes[20] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        let store = FileRecordStore::open(dir.path(), 4).unwrap();
        assert!(matches!(
            store.get_all("tasks"),
            Err(CacheError::ChecksumMismatch { .. })
        ));
    }
}
