//! Asynchronous per-collection record store.
//!
//! Larger-capacity storage for collections expected to outgrow the
//! synchronous store. Records are addressed by identity within a named
//! collection and keep insertion order.

mod file;
mod memory;

pub use file::FileRecordStore;
pub use memory::MemoryRecordStore;

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// One record as the store sees it: identity plus encoded body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: String,
    pub body: serde_json::Value,
}

impl StoredRecord {
    pub fn new(id: impl Into<String>, body: serde_json::Value) -> Self {
        Self { id: id.into(), body }
    }
}

/// Storage for identity-addressed record collections.
pub trait RecordStore: Send + Sync {
    /// All records of a collection in insertion order. Empty if unknown.
    fn get_all(&self, collection: &str) -> Result<Vec<StoredRecord>>;

    /// One record by identity.
    fn get(&self, collection: &str, id: &str) -> Result<Option<StoredRecord>>;

    /// Insert or replace a record, keeping its position when it exists.
    fn put(&self, collection: &str, record: StoredRecord) -> Result<()>;

    /// Replace the whole collection.
    fn replace_all(&self, collection: &str, records: Vec<StoredRecord>) -> Result<()>;

    /// Remove a record. Returns whether it existed.
    fn delete(&self, collection: &str, id: &str) -> Result<bool>;

    /// Remove every record of a collection.
    fn clear(&self, collection: &str) -> Result<()>;

    /// Number of records in a collection.
    fn count(&self, collection: &str) -> Result<usize> {
        Ok(self.get_all(collection)?.len())
    }

    /// Names of all non-empty collections, sorted.
    fn collections(&self) -> Result<Vec<String>>;
}

/// Collection names double as file names, so keep them boring.
pub fn validate_collection_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

    if valid {
        Ok(())
    } else {
        Err(CacheError::InvalidKey(format!("collection name {:?}", name)))
    }
}

/// Drop duplicate identities. A later record replaces an earlier one in the
/// earlier one's position.
pub(crate) fn dedupe(collection: &str, records: Vec<StoredRecord>) -> Vec<StoredRecord> {
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(records.len());
    let mut out: Vec<StoredRecord> = Vec::with_capacity(records.len());

    for record in records {
        match positions.get(&record.id) {
            Some(&pos) => {
                warn!(collection = %collection, id = %record.id, "duplicate identity, keeping last");
                out[pos] = record;
            }
            None => {
                positions.insert(record.id.clone(), out.len());
                out.push(record);
            }
        }
    }

    out
}

/// Insert or replace in place.
pub(crate) fn upsert(records: &mut Vec<StoredRecord>, record: StoredRecord) {
    match records.iter_mut().find(|r| r.id == record.id) {
        Some(existing) => *existing = record,
        None => records.push(record),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_collection_names() {
        assert!(validate_collection_name("sales_data").is_ok());
        assert!(validate_collection_name("tasks-v2").is_ok());
        assert!(validate_collection_name("").is_err());
        assert!(validate_collection_name("../etc").is_err());
        assert!(validate_collection_name("a b").is_err());
    }

    #[test]
    fn test_dedupe_keeps_first_position_last_value() {
        let records = vec![
            StoredRecord::new("a", json!(1)),
            StoredRecord::new("b", json!(2)),
            StoredRecord::new("a", json!(3)),
        ];
        let out = dedupe("c", records);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], StoredRecord::new("a", json!(3)));
        assert_eq!(out[1].id, "b");
    }

    #[test]
    fn test_upsert() {
        let mut records = vec![StoredRecord::new("a", json!(1))];
        upsert(&mut records, StoredRecord::new("b", json!(2)));
        upsert(&mut records, StoredRecord::new("a", json!(9)));
        assert_eq!(records[0].body, json!(9));
        assert_eq!(records.len(), 2);
    }
}
