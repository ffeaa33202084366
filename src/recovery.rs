//! Recovery console: operator diagnostics and manual repair.
//!
//! The console reads the stores live and keeps no state of its own. It
//! never refreshes mounted bindings; callers reload them after a restore
//! or import.
//!
//! Destructive operations take a confirmation callback that is shown the
//! affected keys before anything is removed:
//!
//! ```ignore
//! let removed = console.clear_all_backups(|keys| prompt(keys.len()))?;
//! ```

use crate::error::{CacheError, Result};
use crate::guard::{is_empty_value, item_count};
use crate::kv::KvStore;
use crate::records::{RecordStore, StoredRecord};
use crate::registry::{KeyKind, KeyRegistry};
use crate::subscriptions::{CacheEvent, SubscriptionManager};
use crate::types::{identity_of, SlotStats, StorageKey};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Format version written into export documents.
pub const EXPORT_VERSION: u32 = 1;

/// Diagnostics for one logical key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct KeyReport {
    pub key: StorageKey,
    /// Record-store collection mirrored by this key, if any.
    pub collection: Option<String>,
    pub primary: SlotStats,
    pub backup: SlotStats,
    /// Record count in the record store for collection keys.
    pub store_items: Option<usize>,
}

/// Portable snapshot of every known key's primary value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    /// RFC 3339 timestamp.
    pub export_date: String,
    pub version: u32,
    /// Parsed value, or the raw string when it does not parse.
    pub data: BTreeMap<String, Value>,
}

impl ExportDocument {
    pub fn from_reader(reader: impl std::io::Read) -> Result<Self> {
        serde_json::from_reader(reader).map_err(|e| CacheError::Deserialization(e.to_string()))
    }
}

/// Operator-facing console over the synchronous store, the record store
/// and the key registry.
pub struct RecoveryConsole {
    kv: Arc<dyn KvStore>,
    records: Arc<dyn RecordStore>,
    registry: Arc<KeyRegistry>,
    events: Arc<SubscriptionManager>,
    export_version: u32,
}

impl RecoveryConsole {
    pub fn new(kv: Arc<dyn KvStore>, records: Arc<dyn RecordStore>, registry: Arc<KeyRegistry>) -> Self {
        Self {
            kv,
            records,
            registry,
            events: Arc::new(SubscriptionManager::new()),
            export_version: EXPORT_VERSION,
        }
    }

    pub fn with_events(mut self, events: Arc<SubscriptionManager>) -> Self {
        self.events = events;
        self
    }

    pub fn with_export_version(mut self, version: u32) -> Self {
        self.export_version = version;
        self
    }

    pub fn registry(&self) -> &KeyRegistry {
        &self.registry
    }

    fn slot_stats(&self, key: &StorageKey) -> SlotStats {
        match self.kv.get(key.as_str()) {
            Ok(Some(raw)) => SlotStats {
                present: true,
                bytes: raw.len(),
                items: item_count(&raw),
            },
            Ok(None) => SlotStats::default(),
            Err(e) => {
                warn!(key = %key, error = %e, "slot unreadable during inspection");
                SlotStats::default()
            }
        }
    }

    /// Report both slots of every known key. Never fails: unreadable slots
    /// and an unavailable record store read as empty.
    pub fn inspect(&self) -> Vec<KeyReport> {
        self.registry
            .entries()
            .into_iter()
            .map(|(key, kind)| {
                let collection = match kind {
                    KeyKind::Collection { collection, .. } => Some(collection),
                    KeyKind::Scalar => None,
                };
                let store_items = collection.as_ref().map(|c| {
                    self.records.count(c).unwrap_or_else(|e| {
                        warn!(collection = %c, error = %e, "record store unreadable during inspection");
                        0
                    })
                });

                KeyReport {
                    primary: self.slot_stats(&key),
                    backup: self.slot_stats(&key.backup()),
                    key,
                    collection,
                    store_items,
                }
            })
            .collect()
    }

    /// Copy a key's backup slot verbatim into its primary slot.
    ///
    /// Returns the restored item count.
    pub fn restore_from_backup(&self, key: &StorageKey) -> Result<usize> {
        let raw = self
            .kv
            .get(key.backup().as_str())?
            .ok_or_else(|| CacheError::NoBackup(key.to_string()))?;

        self.kv.set(key.as_str(), &raw)?;

        let items = item_count(&raw);
        info!(key = %key, items, "restored primary slot from backup");
        self.events.publish(CacheEvent::Restored {
            key: key.to_string(),
            items,
        });
        Ok(items)
    }

    /// Restore a collection key from its backup and push the result into
    /// the record store, replacing what is there.
    ///
    /// Nothing is written unless the backup decodes into records carrying
    /// the collection's identity field.
    pub fn restore_collection(&self, key: &StorageKey) -> Result<usize> {
        let Some(KeyKind::Collection {
            collection,
            identity_field,
        }) = self.registry.kind(key)
        else {
            return Err(CacheError::UnknownKey(key.to_string()));
        };

        let backup = key.backup();
        let raw = self
            .kv
            .get(backup.as_str())?
            .ok_or_else(|| CacheError::NoBackup(key.to_string()))?;
        let value: Value = serde_json::from_str(&raw)
            .map_err(|e| CacheError::Deserialization(format!("{}: {}", backup, e)))?;
        let records = records_from_value(key, &collection, &value, &identity_field)?;

        self.restore_from_backup(key)?;

        let count = records.len();
        self.records.replace_all(&collection, records)?;

        info!(key = %key, collection = %collection, records = count, "restored collection from backup");
        Ok(count)
    }

    /// Snapshot every known key's primary value.
    pub fn export_all(&self) -> Result<ExportDocument> {
        let mut data = BTreeMap::new();

        for key in self.registry.keys() {
            let Some(raw) = self.kv.get(key.as_str())? else {
                continue;
            };
            let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
            data.insert(key.to_string(), value);
        }

        Ok(ExportDocument {
            export_date: Utc::now().to_rfc3339(),
            version: self.export_version,
            data,
        })
    }

    /// Export as pretty JSON into a writer.
    pub fn export_to_writer<W: Write>(&self, writer: W) -> Result<ExportDocument> {
        let document = self.export_all()?;
        serde_json::to_writer_pretty(writer, &document)?;
        Ok(document)
    }

    /// Export into `<namespace>-backup-<date>.json` inside `dir`.
    pub fn export_to_dir(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let filename = format!(
            "{}-backup-{}.json",
            self.registry.namespace(),
            Utc::now().format("%Y-%m-%d")
        );
        let path = dir.as_ref().join(filename);

        let mut writer = BufWriter::new(File::create(&path)?);
        let document = self.export_to_writer(&mut writer)?;
        writer.flush()?;

        info!(path = %path.display(), keys = document.data.len(), "exported snapshot");
        Ok(path)
    }

    /// Write an exported document back into storage.
    ///
    /// Every value lands in its primary slot; non-empty values also refresh
    /// the backup slot, and values of collection keys replace the record
    /// store collection. Collection values are decoded before anything is
    /// written, so a value without identifiable records aborts the import
    /// untouched. Returns the number of keys written.
    pub fn import(&self, document: &ExportDocument) -> Result<usize> {
        let mut collections = Vec::new();
        for (raw_key, value) in &document.data {
            let key = StorageKey::new(raw_key.as_str());
            if let Some(KeyKind::Collection {
                collection,
                identity_field,
            }) = self.registry.kind(&key)
            {
                let records = records_from_value(&key, &collection, value, &identity_field)?;
                collections.push((collection, records));
            }
        }

        for (raw_key, value) in &document.data {
            let key = StorageKey::new(raw_key.as_str());
            let encoded = serde_json::to_string(value)?;

            self.kv.set(key.as_str(), &encoded)?;
            if !is_empty_value(value) {
                if let Err(e) = self.kv.set(key.backup().as_str(), &encoded) {
                    debug!(key = %key, error = %e, "backup write skipped during import");
                }
            }

            if !self.registry.contains(&key) {
                self.registry.register_scalar(key);
            }
        }

        for (collection, records) in collections {
            self.records.replace_all(&collection, records)?;
        }

        let keys = document.data.len();
        info!(keys, version = document.version, "imported snapshot");
        self.events.publish(CacheEvent::Imported { keys });
        Ok(keys)
    }

    /// Every backup slot in the namespace, registered or not.
    pub fn backup_keys(&self) -> Result<Vec<StorageKey>> {
        let namespace = self.registry.namespace();
        Ok(self
            .kv
            .keys()?
            .into_iter()
            .filter(|k| namespace.owns(k))
            .map(StorageKey::new)
            .filter(StorageKey::is_backup)
            .collect())
    }

    /// Remove every backup slot once `confirm` approves the list.
    ///
    /// Primary slots are untouched. Returns the number removed.
    pub fn clear_all_backups(&self, confirm: impl FnOnce(&[StorageKey]) -> bool) -> Result<usize> {
        let keys = self.backup_keys()?;
        if keys.is_empty() {
            return Ok(0);
        }
        if !confirm(&keys) {
            return Err(CacheError::ConfirmationDeclined);
        }

        let mut count = 0;
        for key in &keys {
            if self.kv.remove(key.as_str())? {
                count += 1;
            }
        }

        info!(count, "cleared backup slots");
        self.events.publish(CacheEvent::BackupsCleared { count });
        Ok(count)
    }

    /// Remove every namespaced key and empty every registered collection
    /// once `confirm` approves the key list. Returns the number of keys
    /// removed.
    pub fn clear_all(&self, confirm: impl FnOnce(&[StorageKey]) -> bool) -> Result<usize> {
        let namespace = self.registry.namespace();
        let keys: Vec<StorageKey> = self
            .kv
            .keys()?
            .into_iter()
            .filter(|k| namespace.owns(k))
            .map(StorageKey::new)
            .collect();

        if !confirm(&keys) {
            return Err(CacheError::ConfirmationDeclined);
        }

        let mut count = 0;
        for key in &keys {
            if self.kv.remove(key.as_str())? {
                count += 1;
            }
        }
        for (_, kind) in self.registry.entries() {
            if let KeyKind::Collection { collection, .. } = kind {
                self.records.clear(&collection)?;
            }
        }

        warn!(namespace = %namespace, count, "cleared all namespaced state");
        Ok(count)
    }

    /// Register namespaced keys already present in the synchronous store.
    pub fn discover(&self) -> Result<usize> {
        self.registry.discover(self.kv.as_ref())
    }
}

/// Decode a collection value into records.
///
/// An empty array decodes to no records. A non-empty array in which no
/// element carries `identity_field` is refused rather than read as empty.
fn records_from_value(
    key: &StorageKey,
    collection: &str,
    value: &Value,
    identity_field: &str,
) -> Result<Vec<StoredRecord>> {
    let Value::Array(items) = value else {
        return Err(CacheError::Deserialization(format!(
            "{} does not hold a JSON array",
            key
        )));
    };

    let records: Vec<StoredRecord> = items
        .iter()
        .filter_map(|body| identity_of(body, identity_field).map(|id| StoredRecord::new(id, body.clone())))
        .collect();

    if records.is_empty() && !items.is_empty() {
        warn!(key = %key, identity_field, items = items.len(), "no record carries the identity field");
        return Err(CacheError::MissingIdentity {
            collection: collection.to_string(),
        });
    }
    if records.len() < items.len() {
        warn!(key = %key, skipped = items.len() - records.len(), "records without identity dropped");
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KnownKey;
    use crate::kv::MemoryKvStore;
    use crate::records::MemoryRecordStore;
    use crate::types::Namespace;
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        kv: Arc<MemoryKvStore>,
        records: Arc<MemoryRecordStore>,
        console: RecoveryConsole,
    }

    fn fixture() -> Fixture {
        let kv = Arc::new(MemoryKvStore::new());
        let records = Arc::new(MemoryRecordStore::new());
        let registry = Arc::new(KeyRegistry::with_known(
            Namespace::new("shopee"),
            &[
                KnownKey::scalar("settings"),
                KnownKey::scalar("sales_data"),
                KnownKey::collection("tasks_def", "tasks"),
                KnownKey::collection("stock", "stock").identity_field("sku"),
            ],
        ));
        let console = RecoveryConsole::new(kv.clone(), records.clone(), registry);
        Fixture { kv, records, console }
    }

    #[test]
    fn test_inspect_reports_both_slots() {
        let f = fixture();
        f.kv.set("shopee_sales_data", "[1,2,3]").unwrap();
        f.kv.set("shopee_sales_data_backup", "[1,2,3,4]").unwrap();
        f.kv.set("shopee_settings", "{corrupt").unwrap();
        f.records
            .replace_all("tasks", vec![StoredRecord::new("t1", json!({"id": "t1"}))])
            .unwrap();

        let reports = f.console.inspect();
        assert_eq!(reports.len(), 4);

        let sales = reports.iter().find(|r| r.key.as_str() == "shopee_sales_data").unwrap();
        assert_eq!(sales.primary.items, 3);
        assert_eq!(sales.primary.bytes, 7);
        assert_eq!(sales.backup.items, 4);
        assert_eq!(sales.store_items, None);

        let settings = reports.iter().find(|r| r.key.as_str() == "shopee_settings").unwrap();
        assert!(settings.primary.present);
        assert_eq!(settings.primary.items, 0);
        assert!(!settings.backup.present);

        let tasks = reports.iter().find(|r| r.key.as_str() == "shopee_tasks_def").unwrap();
        assert_eq!(tasks.collection.as_deref(), Some("tasks"));
        assert_eq!(tasks.store_items, Some(1));
    }

    #[test]
    fn test_inspect_survives_unavailable_store() {
        let f = fixture();
        f.records.set_unavailable(true);
        let reports = f.console.inspect();
        let tasks = reports.iter().find(|r| r.collection.as_deref() == Some("tasks")).unwrap();
        assert_eq!(tasks.store_items, Some(0));
    }

    #[test]
    fn test_restore_from_backup() {
        let f = fixture();
        f.kv.set("shopee_sales_data", "{bad").unwrap();
        f.kv.set("shopee_sales_data_backup", "[1,2]").unwrap();

        let key = StorageKey::from("shopee_sales_data");
        assert_eq!(f.console.restore_from_backup(&key).unwrap(), 2);
        assert_eq!(f.kv.get("shopee_sales_data").unwrap().as_deref(), Some("[1,2]"));

        let missing = StorageKey::from("shopee_settings");
        assert!(matches!(
            f.console.restore_from_backup(&missing),
            Err(CacheError::NoBackup(_))
        ));
    }

    #[test]
    fn test_restore_collection_pushes_into_store() {
        let f = fixture();
        f.kv.set("shopee_tasks_def_backup", r#"[{"id":"a"},{"id":"b"}]"#).unwrap();
        f.records
            .replace_all("tasks", vec![StoredRecord::new("x", json!({"id": "x"}))])
            .unwrap();

        let key = StorageKey::from("shopee_tasks_def");
        assert_eq!(f.console.restore_collection(&key).unwrap(), 2);
        let ids: Vec<String> = f.records.get_all("tasks").unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert!(matches!(
            f.console.restore_collection(&StorageKey::from("shopee_settings")),
            Err(CacheError::UnknownKey(_))
        ));
    }

    #[test]
    fn test_restore_collection_uses_registered_identity_field() {
        let f = fixture();
        f.kv.set(
            "shopee_stock_backup",
            r#"[{"sku":"A-1","qty":4},{"sku":"B-2","qty":0},{"sku":"C-3","qty":9}]"#,
        )
        .unwrap();

        let key = StorageKey::from("shopee_stock");
        assert_eq!(f.console.restore_collection(&key).unwrap(), 3);
        let ids: Vec<String> = f.records.get_all("stock").unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["A-1", "B-2", "C-3"]);
    }

    #[test]
    fn test_restore_collection_refuses_unidentifiable_backup() {
        let f = fixture();
        f.kv.set("shopee_tasks_def", r#"[{"id":"keep"}]"#).unwrap();
        f.kv.set("shopee_tasks_def_backup", r#"[{"sku":"A-1"},{"sku":"B-2"}]"#).unwrap();
        f.records
            .replace_all("tasks", vec![StoredRecord::new("keep", json!({"id": "keep"}))])
            .unwrap();

        let result = f.console.restore_collection(&StorageKey::from("shopee_tasks_def"));
        assert!(matches!(result, Err(CacheError::MissingIdentity { collection }) if collection == "tasks"));
        assert_eq!(f.records.count("tasks").unwrap(), 1);
        assert_eq!(f.kv.get("shopee_tasks_def").unwrap().as_deref(), Some(r#"[{"id":"keep"}]"#));
    }

    #[test]
    fn test_import_refuses_unidentifiable_collection() {
        let f = fixture();
        f.records
            .replace_all("stock", vec![StoredRecord::new("A-1", json!({"sku": "A-1"}))])
            .unwrap();

        let mut data = BTreeMap::new();
        data.insert("shopee_settings".to_string(), json!({"currency": "IDR"}));
        data.insert("shopee_stock".to_string(), json!([{"id": "A-1"}]));
        let document = ExportDocument {
            export_date: Utc::now().to_rfc3339(),
            version: EXPORT_VERSION,
            data,
        };

        assert!(matches!(
            f.console.import(&document),
            Err(CacheError::MissingIdentity { .. })
        ));
        assert_eq!(f.records.count("stock").unwrap(), 1);
        assert!(f.kv.get("shopee_settings").unwrap().is_none());
    }

    #[test]
    fn test_export_document_shape() {
        let f = fixture();
        f.kv.set("shopee_settings", r#"{"currency":"IDR"}"#).unwrap();
        f.kv.set("shopee_sales_data", "not json").unwrap();

        let document = f.console.export_all().unwrap();
        assert_eq!(document.version, EXPORT_VERSION);
        assert_eq!(document.data.len(), 2);
        assert_eq!(document.data["shopee_settings"]["currency"], "IDR");
        assert_eq!(document.data["shopee_sales_data"], json!("not json"));
        assert!(chrono::DateTime::parse_from_rfc3339(&document.export_date).is_ok());

        let encoded = serde_json::to_value(&document).unwrap();
        assert!(encoded.get("exportDate").is_some());
    }

    #[test]
    fn test_export_to_dir_then_import() {
        let f = fixture();
        f.kv.set("shopee_settings", r#"{"currency":"IDR"}"#).unwrap();
        f.kv.set("shopee_tasks_def", r#"[{"id":"a"},{"id":"b"},{"title":"anon"}]"#).unwrap();

        let dir = TempDir::new().unwrap();
        let path = f.console.export_to_dir(dir.path()).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("shopee-backup-"));

        let document = ExportDocument::from_reader(File::open(&path).unwrap()).unwrap();

        let g = fixture();
        assert_eq!(g.console.import(&document).unwrap(), 2);
        assert_eq!(
            g.kv.get("shopee_settings").unwrap().as_deref(),
            Some(r#"{"currency":"IDR"}"#)
        );
        assert!(g.kv.get("shopee_settings_backup").unwrap().is_some());
        assert_eq!(g.records.count("tasks").unwrap(), 2);
    }

    #[test]
    fn test_clear_all_backups_requires_confirmation() {
        let f = fixture();
        f.kv.set("shopee_sales_data", "[1]").unwrap();
        f.kv.set("shopee_sales_data_backup", "[1]").unwrap();
        f.kv.set("shopee_unregistered_backup", "[1]").unwrap();
        f.kv.set("other_thing_backup", "[1]").unwrap();

        assert!(matches!(
            f.console.clear_all_backups(|_| false),
            Err(CacheError::ConfirmationDeclined)
        ));
        assert!(f.kv.get("shopee_sales_data_backup").unwrap().is_some());

        let mut shown = 0;
        let removed = f
            .console
            .clear_all_backups(|keys| {
                shown = keys.len();
                true
            })
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(shown, 2);
        assert!(f.kv.get("shopee_sales_data").unwrap().is_some());
        assert!(f.kv.get("other_thing_backup").unwrap().is_some());
    }

    #[test]
    fn test_clear_all() {
        let f = fixture();
        f.kv.set("shopee_settings", "{}").unwrap();
        f.kv.set("shopee_tasks_def", "[]").unwrap();
        f.kv.set("other_thing", "1").unwrap();
        f.records
            .replace_all("tasks", vec![StoredRecord::new("t", json!({"id": "t"}))])
            .unwrap();

        assert_eq!(f.console.clear_all(|_| true).unwrap(), 2);
        assert_eq!(f.records.count("tasks").unwrap(), 0);
        assert_eq!(f.kv.keys().unwrap(), vec!["other_thing".to_string()]);
    }

    #[test]
    fn test_discover_extends_inspection() {
        let f = fixture();
        f.kv.set("shopee_new_widget", "[1]").unwrap();
        assert_eq!(f.console.discover().unwrap(), 1);
        assert_eq!(f.console.inspect().len(), 5);
    }
}
