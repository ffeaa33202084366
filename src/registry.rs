//! Registry of known logical keys.
//!
//! The recovery console works over this set. It is seeded from
//! configuration, extended by every binding that mounts, and can discover
//! namespaced keys already present in the synchronous store.

use crate::config::KnownKey;
use crate::error::Result;
use crate::kv::KvStore;
use crate::types::{Namespace, StorageKey, DEFAULT_IDENTITY_FIELD};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// How a key is used.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyKind {
    /// A scalar slot.
    Scalar,
    /// Legacy mirror of a record-store collection whose records are
    /// identified by `identity_field`.
    Collection {
        collection: String,
        identity_field: String,
    },
}

/// Known keys of one namespace.
pub struct KeyRegistry {
    namespace: Namespace,
    keys: RwLock<BTreeMap<StorageKey, KeyKind>>,
}

impl KeyRegistry {
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            keys: RwLock::new(BTreeMap::new()),
        }
    }

    /// Seed from configured keys.
    pub fn with_known(namespace: Namespace, known: &[KnownKey]) -> Self {
        let registry = Self::new(namespace);
        for k in known {
            let key = registry.namespace.key(&k.entity);
            match &k.collection {
                Some(collection) => registry.register_collection(
                    key,
                    collection,
                    k.identity_field.as_deref().unwrap_or(DEFAULT_IDENTITY_FIELD),
                ),
                None => registry.register_scalar(key),
            }
        }
        registry
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Register a scalar key. Does not downgrade a collection key.
    pub fn register_scalar(&self, key: StorageKey) {
        self.keys.write().entry(key).or_insert(KeyKind::Scalar);
    }

    pub fn register_collection(&self, key: StorageKey, collection: &str, identity_field: &str) {
        self.keys.write().insert(
            key,
            KeyKind::Collection {
                collection: collection.to_string(),
                identity_field: identity_field.to_string(),
            },
        );
    }

    pub fn kind(&self, key: &StorageKey) -> Option<KeyKind> {
        self.keys.read().get(key).cloned()
    }

    pub fn contains(&self, key: &StorageKey) -> bool {
        self.keys.read().contains_key(key)
    }

    /// All registered keys, sorted.
    pub fn keys(&self) -> Vec<StorageKey> {
        self.keys.read().keys().cloned().collect()
    }

    pub fn entries(&self) -> Vec<(StorageKey, KeyKind)> {
        self.keys
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Register every namespaced primary key found in the store.
    ///
    /// Returns the number of newly registered keys. Backup keys are mapped
    /// to their primary so orphaned backups are still reachable.
    pub fn discover(&self, kv: &dyn KvStore) -> Result<usize> {
        let mut added = 0;
        for raw in kv.keys()? {
            if !self.namespace.owns(&raw) {
                continue;
            }
            let key = StorageKey::new(raw);
            let key = key.primary().unwrap_or(key);
            if !self.contains(&key) {
                self.register_scalar(key);
                added += 1;
            }
        }
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    #[test]
    fn test_seeded_from_config() {
        let registry = KeyRegistry::with_known(
            Namespace::new("shopee"),
            &[
                KnownKey::scalar("settings"),
                KnownKey::collection("tasks_def", "tasks"),
                KnownKey::collection("stock", "stock").identity_field("sku"),
            ],
        );
        assert_eq!(registry.keys().len(), 3);
        assert_eq!(
            registry.kind(&StorageKey::from("shopee_tasks_def")),
            Some(KeyKind::Collection {
                collection: "tasks".into(),
                identity_field: "id".into(),
            })
        );
        assert_eq!(
            registry.kind(&StorageKey::from("shopee_stock")),
            Some(KeyKind::Collection {
                collection: "stock".into(),
                identity_field: "sku".into(),
            })
        );
    }

    #[test]
    fn test_scalar_does_not_downgrade_collection() {
        let registry = KeyRegistry::new(Namespace::new("app"));
        let key = StorageKey::from("app_tasks");
        registry.register_collection(key.clone(), "tasks", "id");
        registry.register_scalar(key.clone());
        assert!(matches!(registry.kind(&key), Some(KeyKind::Collection { .. })));
    }

    #[test]
    fn test_discover() {
        let kv = MemoryKvStore::new();
        kv.set("app_goals", "[]").unwrap();
        kv.set("app_goals_backup", "[1]").unwrap();
        kv.set("app_orphan_backup", "[1]").unwrap();
        kv.set("other_thing", "1").unwrap();

        let registry = KeyRegistry::new(Namespace::new("app"));
        assert_eq!(registry.discover(&kv).unwrap(), 2);
        assert_eq!(
            registry.keys(),
            vec![StorageKey::from("app_goals"), StorageKey::from("app_orphan")]
        );
        assert_eq!(registry.discover(&kv).unwrap(), 0);
    }
}
