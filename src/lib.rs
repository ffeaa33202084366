//! # State Cache
//!
//! A durable local state cache that keeps in-memory application state in
//! sync with on-device storage.
//!
//! ## Core Concepts
//!
//! - **Primary store**: a small synchronous key-value store with a byte quota
//! - **Backup slots**: every key `K` is shadowed by `K_backup`, holding its
//!   last known-good non-empty value
//! - **Record store**: larger per-collection storage addressed by identity
//! - **Bindings**: in-memory values persisted through debounced writes,
//!   guarded against empty-over-non-empty transitions
//! - **Migration**: one-shot copy of legacy keys into the record store
//! - **Recovery console**: inspection, restore, export, and purge tooling
//!
//! ## Example
//!
//! ```ignore
//! use statecache::{Cache, CacheConfig};
//!
//! let cache = Cache::open(CacheConfig {
//!     namespace: "shopee".into(),
//!     data_dir: "./state".into(),
//!     ..Default::default()
//! })?;
//!
//! // Scalar value backed by `shopee_settings` and `shopee_settings_backup`
//! let settings = cache.scalar("settings", serde_json::json!({}))?;
//! settings.set(serde_json::json!({"currency": "IDR"}));
//!
//! // Collection migrated from `shopee_tasks_def` on first mount
//! let tasks = cache.collection::<Task>("tasks", "tasks_def", Vec::new())?;
//! tasks.add_item(Task::new("t1", "Restock"))?;
//!
//! // Operator tooling
//! for report in cache.console().inspect() {
//!     println!("{} {} {}", report.key, report.primary.items, report.backup.items);
//! }
//! ```

pub mod bindings;
pub mod cache;
pub mod clock;
pub mod codec;
pub mod config;
pub mod debounce;
pub mod error;
mod frame;
pub mod guard;
pub mod kv;
pub mod migration;
pub mod records;
pub mod recovery;
pub mod registry;
pub mod scheduler;
pub mod subscriptions;
pub mod tiered;
pub mod types;

// Re-exports
pub use bindings::{
    load_scalar, BindingContext, CollectionBinding, CollectionOptions, Sanitizer, ScalarBinding,
    ScalarLoad, ScalarOptions,
};
pub use cache::Cache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{Codec, JsonCodec};
pub use config::{CacheConfig, KnownKey};
pub use debounce::{DebounceStats, Debouncer};
pub use error::{CacheError, Result};
pub use guard::{is_empty_encoded, is_empty_value, item_count, StateLossGuard, Verdict};
pub use kv::{FileKvStore, KvStore, MemoryKvStore};
pub use migration::{
    migrate_one, read_legacy, LegacyRead, MigrationEntry, MigrationReport, MigrationStatus,
    Migrator,
};
pub use records::{FileRecordStore, MemoryRecordStore, RecordStore, StoredRecord};
pub use recovery::{ExportDocument, KeyReport, RecoveryConsole, EXPORT_VERSION};
pub use registry::{KeyKind, KeyRegistry};
pub use scheduler::{FlushWorker, Flushable};
pub use subscriptions::{
    CacheEvent, DropReason, SubscriptionConfig, SubscriptionFilter, SubscriptionHandle,
    SubscriptionId, SubscriptionManager,
};
pub use tiered::{
    FanOut, LegacyMirrorTier, RecordStoreTier, StorageTier, TierRead, TierStatus, TieredStorage,
};
pub use types::*;
