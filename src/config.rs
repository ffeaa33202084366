//! Cache configuration.

use crate::error::Result;
use crate::types::Namespace;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A logical key the recovery console should always know about.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownKey {
    /// Entity name, without the namespace prefix.
    pub entity: String,

    /// Record-store collection mirrored by this key, if any.
    #[serde(default)]
    pub collection: Option<String>,

    /// Identity field of the collection's records. Defaults to `"id"`.
    #[serde(default)]
    pub identity_field: Option<String>,
}

impl KnownKey {
    pub fn scalar(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            collection: None,
            identity_field: None,
        }
    }

    pub fn collection(entity: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            collection: Some(collection.into()),
            identity_field: None,
        }
    }

    pub fn identity_field(mut self, field: impl Into<String>) -> Self {
        self.identity_field = Some(field.into());
        self
    }
}

/// Cache configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Application namespace prefixed to every key.
    pub namespace: String,

    /// Base directory for file-backed stores.
    pub data_dir: PathBuf,

    /// Quiet period before a pending write fires.
    pub debounce_ms: u64,

    /// Capacity of the synchronous store in bytes.
    pub kv_capacity_bytes: usize,

    /// Collections kept decoded in memory by the file record store.
    pub record_cache_size: usize,

    /// Tick interval of the background flush worker.
    pub flush_interval_ms: u64,

    /// Start a background thread that fires due writes.
    pub background_flush: bool,

    /// Version number stamped on export documents.
    pub export_version: u32,

    /// Keys registered with the recovery console up front.
    pub known_keys: Vec<KnownKey>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: "app".to_string(),
            data_dir: PathBuf::from("./state"),
            debounce_ms: 500,
            kv_capacity_bytes: 5 * 1024 * 1024, // 5MB
            record_cache_size: 64,
            flush_interval_ms: 50,
            background_flush: true,
            export_version: 1,
            known_keys: Vec::new(),
        }
    }
}

impl CacheConfig {
    /// Load configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn namespace(&self) -> Namespace {
        Namespace::new(self.namespace.clone())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.debounce(), Duration::from_millis(500));
        assert_eq!(config.namespace().as_str(), "app");
        assert_eq!(config.export_version, 1);
    }

    #[test]
    fn test_partial_json_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"namespace": "shopee", "debounce_ms": 250,
                "known_keys": [{{"entity": "tasks_def", "collection": "tasks"}},
                               {{"entity": "stock", "collection": "stock", "identity_field": "sku"}}]}}"#
        )
        .unwrap();

        let config = CacheConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.namespace, "shopee");
        assert_eq!(config.debounce_ms, 250);
        assert_eq!(config.kv_capacity_bytes, 5 * 1024 * 1024);
        assert_eq!(
            config.known_keys,
            vec![
                KnownKey::collection("tasks_def", "tasks"),
                KnownKey::collection("stock", "stock").identity_field("sku"),
            ]
        );
    }
}
