//! The cache facade: shared storage handles, bindings, and tooling.

use crate::bindings::{
    BindingContext, CollectionBinding, CollectionOptions, ScalarBinding, ScalarOptions,
};
use crate::clock::{Clock, SystemClock};
use crate::codec::Codec;
use crate::config::CacheConfig;
use crate::error::Result;
use crate::kv::{FileKvStore, KvStore, MemoryKvStore};
use crate::migration::{MigrationEntry, MigrationReport, Migrator};
use crate::records::{FileRecordStore, MemoryRecordStore, RecordStore};
use crate::recovery::RecoveryConsole;
use crate::registry::{KeyKind, KeyRegistry};
use crate::scheduler::{self, Flushable, FlushWorker};
use crate::subscriptions::{SubscriptionConfig, SubscriptionHandle, SubscriptionManager};
use crate::types::{Namespace, Record, StorageKey};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, Weak};
use tracing::info;

/// Directory of the synchronous store inside `data_dir`.
const KV_DIR: &str = "kv";

/// Directory of the record store inside `data_dir`.
const RECORDS_DIR: &str = "records";

/// Owns the storage service shared by every binding of one namespace.
pub struct Cache {
    config: CacheConfig,
    ctx: BindingContext,
    registry: Arc<KeyRegistry>,
    /// Every mounted binding, for `flush_all` without a worker.
    mounted: Mutex<Vec<Weak<dyn Flushable>>>,
    worker: Option<FlushWorker>,
}

impl Cache {
    /// Open file-backed stores under `config.data_dir`.
    pub fn open(config: CacheConfig) -> Result<Self> {
        let kv = FileKvStore::open(config.data_dir.join(KV_DIR), config.kv_capacity_bytes)?;
        let records = FileRecordStore::open(config.data_dir.join(RECORDS_DIR), config.record_cache_size)?;
        info!(data_dir = %config.data_dir.display(), namespace = %config.namespace, "opened cache");
        Self::with_backends(config, Arc::new(kv), Arc::new(records), Arc::new(SystemClock))
    }

    /// Volatile stores, for tests and previews.
    pub fn in_memory(config: CacheConfig) -> Result<Self> {
        let kv = MemoryKvStore::with_capacity(config.kv_capacity_bytes);
        Self::with_backends(
            config,
            Arc::new(kv),
            Arc::new(MemoryRecordStore::new()),
            Arc::new(SystemClock),
        )
    }

    pub fn with_backends(
        config: CacheConfig,
        kv: Arc<dyn KvStore>,
        records: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let registry = Arc::new(KeyRegistry::with_known(config.namespace(), &config.known_keys));
        let ctx = BindingContext::new(kv, records)
            .with_clock(clock)
            .with_debounce(config.debounce());

        let worker = if config.background_flush {
            Some(FlushWorker::start(config.flush_interval())?)
        } else {
            None
        };

        Ok(Self {
            config,
            ctx,
            registry,
            mounted: Mutex::new(Vec::new()),
            worker,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn namespace(&self) -> &Namespace {
        self.registry.namespace()
    }

    /// Namespaced key for an entity.
    pub fn key(&self, entity: &str) -> StorageKey {
        self.namespace().key(entity)
    }

    pub fn context(&self) -> &BindingContext {
        &self.ctx
    }

    pub fn registry(&self) -> &Arc<KeyRegistry> {
        &self.registry
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.ctx.kv
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.ctx.records
    }

    pub fn events(&self) -> &Arc<SubscriptionManager> {
        &self.ctx.events
    }

    /// Mount a JSON scalar binding for `entity`.
    pub fn scalar<T>(&self, entity: &str, default: T) -> Result<Arc<ScalarBinding<T>>>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        self.scalar_with(ScalarOptions::new(self.key(entity), default))
    }

    pub fn scalar_with<T, C>(&self, options: ScalarOptions<T, C>) -> Result<Arc<ScalarBinding<T, C>>>
    where
        T: Clone + Send + Sync + 'static,
        C: Codec<T> + 'static,
    {
        self.registry.register_scalar(options.key.clone());
        let binding = Arc::new(ScalarBinding::mount(options, &self.ctx));
        self.track(&binding)?;
        Ok(binding)
    }

    /// Mount and initialize a collection binding that migrates from and
    /// mirrors into the namespaced `legacy_entity` key.
    pub fn collection<R: Record>(
        &self,
        store_name: &str,
        legacy_entity: &str,
        default: Vec<R>,
    ) -> Result<Arc<CollectionBinding<R>>> {
        self.collection_with(
            CollectionOptions::new(store_name, default).legacy_key(self.key(legacy_entity)),
        )
    }

    pub fn collection_with<R: Record>(
        &self,
        options: CollectionOptions<R>,
    ) -> Result<Arc<CollectionBinding<R>>> {
        if let Some(key) = &options.legacy_key {
            self.registry
                .register_collection(key.clone(), &options.store_name, R::IDENTITY_FIELD);
        }
        let binding = Arc::new(CollectionBinding::mount(options, &self.ctx));
        binding.initialize();
        self.track(&binding)?;
        Ok(binding)
    }

    fn track<T: Flushable + 'static>(&self, binding: &Arc<T>) -> Result<()> {
        let target: Arc<dyn Flushable> = binding.clone();
        self.mounted.lock().push(Arc::downgrade(&target));
        if let Some(worker) = &self.worker {
            scheduler::register(worker, binding)?;
        }
        Ok(())
    }

    /// Flush every mounted binding. Returns the number of writes that
    /// reached storage.
    pub fn flush_all(&self) -> Result<usize> {
        if let Some(worker) = &self.worker {
            return worker.flush_all();
        }

        let mut mounted = self.mounted.lock();
        mounted.retain(|t| t.strong_count() > 0);
        Ok(mounted
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|t| t.flush_now().is_written())
            .count())
    }

    pub fn subscribe(&self, config: SubscriptionConfig) -> SubscriptionHandle {
        self.ctx.events.subscribe(config)
    }

    pub fn console(&self) -> RecoveryConsole {
        RecoveryConsole::new(
            Arc::clone(&self.ctx.kv),
            Arc::clone(&self.ctx.records),
            Arc::clone(&self.registry),
        )
        .with_events(Arc::clone(&self.ctx.events))
        .with_export_version(self.config.export_version)
    }

    /// Migrator over every registered collection key.
    pub fn migrator(&self) -> Migrator {
        self.registry
            .entries()
            .into_iter()
            .filter_map(|(key, kind)| match kind {
                KeyKind::Collection {
                    collection,
                    identity_field,
                } => Some(MigrationEntry::new(key, collection).with_identity_field(identity_field)),
                KeyKind::Scalar => None,
            })
            .fold(
                Migrator::new(Arc::clone(&self.ctx.kv), Arc::clone(&self.ctx.records)),
                Migrator::with_entry,
            )
    }

    pub fn migrate_all(&self) -> MigrationReport {
        let report = self.migrator().run();
        info!(migrated = report.migrated(), failed = report.failed(), "migration pass finished");
        report
    }
}
