//! Error handling and edge case tests.

use serde::{Deserialize, Serialize};
use statecache::{
    BindingContext, Cache, CacheConfig, CacheError, Codec, CollectionBinding, CollectionOptions,
    FileRecordStore, KvStore, LoadSource, ManualClock, MemoryKvStore,
    MemoryRecordStore, Record, RecordStore, ScalarBinding, ScalarOptions, StorageKey,
    StoredRecord, WriteOutcome,
};
use std::sync::Arc;
use tempfile::TempDir;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Item {
    id: String,
    qty: u32,
}

impl Record for Item {
    fn identity(&self) -> &str {
        &self.id
    }
}

fn item(id: &str) -> Item {
    Item {
        id: id.to_string(),
        qty: 1,
    }
}

fn context(kv: Arc<MemoryKvStore>, records: Arc<MemoryRecordStore>) -> BindingContext {
    BindingContext::new(kv, records).with_clock(Arc::new(ManualClock::new()))
}

/// Codec that refuses to encode one specific value.
struct PickyCodec;

impl Codec<u32> for PickyCodec {
    fn encode(&self, value: &u32) -> statecache::Result<String> {
        if *value == 13 {
            return Err(CacheError::Serialization("13 is not allowed".into()));
        }
        Ok(value.to_string())
    }

    fn decode(&self, raw: &str) -> statecache::Result<u32> {
        raw.parse()
            .map_err(|e: std::num::ParseIntError| CacheError::Deserialization(e.to_string()))
    }
}

// --- Write Errors ---

#[test]
fn test_serialization_failure_keeps_previous_value() {
    let kv = Arc::new(MemoryKvStore::new());
    let ctx = context(kv.clone(), Arc::new(MemoryRecordStore::new()));
    let binding = ScalarBinding::mount(
        ScalarOptions::new(StorageKey::from("app_lucky"), 0u32).with_codec(PickyCodec),
        &ctx,
    );

    binding.set(7);
    assert!(binding.flush().is_written());

    binding.set(13);
    assert_eq!(binding.flush(), WriteOutcome::Failed);
    assert!(matches!(
        binding.error().as_deref(),
        Some(CacheError::Serialization(_))
    ));
    assert_eq!(binding.get(), 13);
    assert_eq!(kv.get("app_lucky").unwrap().as_deref(), Some("7"));
}

#[test]
fn test_primary_quota_is_surfaced() {
    let kv = Arc::new(MemoryKvStore::with_capacity(64));
    let ctx = context(kv.clone(), Arc::new(MemoryRecordStore::new()));
    let binding = ScalarBinding::mount(
        ScalarOptions::new(StorageKey::from("app_notes"), String::new()),
        &ctx,
    );

    binding.set("x".repeat(200));
    assert_eq!(binding.flush(), WriteOutcome::Failed);
    match binding.error().as_deref() {
        Some(CacheError::QuotaExceeded { key, capacity, .. }) => {
            assert_eq!(key, "app_notes");
            assert_eq!(*capacity, 64);
        }
        other => panic!("expected quota error, got {:?}", other),
    }
    assert!(kv.get("app_notes").unwrap().is_none());
}

#[test]
fn test_mirror_quota_does_not_fail_collection() {
    let kv = Arc::new(MemoryKvStore::with_capacity(16));
    let records = Arc::new(MemoryRecordStore::new());
    let ctx = context(kv.clone(), records.clone());
    let binding: CollectionBinding<Item> = CollectionBinding::mount(
        CollectionOptions::new("items", Vec::new()).legacy_key(StorageKey::from("app_items")),
        &ctx,
    );
    binding.initialize();

    for i in 0..10 {
        binding.add_item(item(&format!("i{}", i))).unwrap();
    }
    assert_eq!(
        binding.flush(),
        WriteOutcome::Written {
            items: 10,
            backed_up: false
        }
    );
    assert!(binding.error().is_none());
    assert_eq!(records.count("items").unwrap(), 10);
    assert!(kv.get("app_items").unwrap().is_none());
}

#[test]
fn test_unavailable_record_store_falls_back_to_default() {
    let kv = Arc::new(MemoryKvStore::new());
    let records = Arc::new(MemoryRecordStore::new());
    records.set_unavailable(true);
    let ctx = context(kv, records);

    let binding: CollectionBinding<Item> = CollectionBinding::mount(
        CollectionOptions::new("items", vec![item("seed")]),
        &ctx,
    );
    binding.initialize();

    assert!(binding.is_initialized());
    assert!(!binding.is_loading());
    assert_eq!(binding.data(), vec![item("seed")]);
    assert_eq!(binding.source(), LoadSource::Default);
    assert!(matches!(
        binding.error().as_deref(),
        Some(CacheError::Unavailable(_))
    ));
}

// --- Read Corruption ---

#[test]
fn test_corrupt_records_are_skipped() {
    let kv = Arc::new(MemoryKvStore::new());
    let records = Arc::new(MemoryRecordStore::new());
    records
        .replace_all(
            "items",
            vec![
                StoredRecord::new("a", serde_json::json!({"id": "a", "qty": 2})),
                StoredRecord::new("b", serde_json::json!({"id": "b", "qty": "many"})),
            ],
        )
        .unwrap();
    let ctx = context(kv, records);

    let binding: CollectionBinding<Item> =
        CollectionBinding::mount(CollectionOptions::new("items", Vec::new()), &ctx);
    binding.initialize();
    assert_eq!(binding.len(), 1);
    assert!(binding.error().is_none());
}

#[test]
fn test_both_slots_corrupt_uses_default() {
    let kv = Arc::new(MemoryKvStore::new());
    kv.set("app_limits", "{").unwrap();
    kv.set("app_limits_backup", "}").unwrap();
    let ctx = context(kv, Arc::new(MemoryRecordStore::new()));

    let binding = ScalarBinding::mount(
        ScalarOptions::new(StorageKey::from("app_limits"), vec![1u32, 2]),
        &ctx,
    );
    assert_eq!(binding.source(), LoadSource::Default);
    assert_eq!(binding.get(), vec![1, 2]);
}

#[test]
fn test_damaged_primary_file_still_recovers_from_backup() {
    let dir = TempDir::new().unwrap();
    let config = CacheConfig {
        namespace: "shopee".into(),
        data_dir: dir.path().to_path_buf(),
        background_flush: false,
        ..Default::default()
    };
    let stock: Vec<Item> = (0..12).map(|i| item(&format!("i{}", i))).collect();

    {
        let cache = Cache::open(config.clone()).unwrap();
        let binding = cache.scalar("sales_data", Vec::<Item>::new()).unwrap();
        binding.set(stock.clone());
        assert!(binding.flush().is_written());
    }

    let primary_file = dir.path().join("kv").join("primary.kv");
    let mut bytes = std::fs::read(&primary_file).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    std::fs::write(&primary_file, &bytes).unwrap();

    let cache = Cache::open(config).unwrap();
    let binding = cache.scalar("sales_data", Vec::<Item>::new()).unwrap();
    assert_eq!(binding.source(), LoadSource::Backup);
    assert_eq!(binding.get(), stock);
    assert!(cache.kv().get("shopee_sales_data").unwrap().is_some());
}

#[test]
fn test_second_open_is_locked() {
    let dir = TempDir::new().unwrap();
    let _first = FileRecordStore::open(dir.path(), 4).unwrap();
    assert!(matches!(
        FileRecordStore::open(dir.path(), 4),
        Err(CacheError::Locked)
    ));
}

// --- Console Errors ---

#[test]
fn test_restore_without_backup() {
    let cache = Cache::in_memory(CacheConfig {
        background_flush: false,
        ..Default::default()
    })
    .unwrap();
    let result = cache
        .console()
        .restore_from_backup(&StorageKey::from("app_missing"));
    assert!(matches!(result, Err(CacheError::NoBackup(key)) if key == "app_missing"));
}

#[test]
fn test_clear_backups_declined_keeps_slots() {
    let cache = Cache::in_memory(CacheConfig {
        background_flush: false,
        ..Default::default()
    })
    .unwrap();
    cache.kv().set("app_goals_backup", "[1]").unwrap();

    let result = cache.console().clear_all_backups(|_| false);
    assert!(matches!(result, Err(CacheError::ConfirmationDeclined)));
    assert!(cache.kv().get("app_goals_backup").unwrap().is_some());
}

#[test]
fn test_invalid_collection_name() {
    let records = MemoryRecordStore::new();
    assert!(matches!(
        records.get_all("../escape"),
        Err(CacheError::InvalidKey(_))
    ));
}
