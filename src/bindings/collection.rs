//! Collection binding: identity-addressed records in the record store,
//! mirrored into an optional legacy synchronous key.

use super::{BindingContext, Sanitizer};
use crate::debounce::{DebounceStats, Debouncer};
use crate::error::{CacheError, Result};
use crate::guard::{StateLossGuard, Verdict};
use crate::kv::KvStore;
use crate::migration::{migrate_one, MigrationEntry, MigrationStatus};
use crate::records::{RecordStore, StoredRecord};
use crate::scheduler::Flushable;
use crate::subscriptions::{CacheEvent, SubscriptionManager};
use crate::tiered::{LegacyMirrorTier, RecordStoreTier, TieredStorage};
use crate::types::{LoadSource, Record, StorageKey, WriteOutcome};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Options for mounting a collection binding.
pub struct CollectionOptions<R> {
    /// Record-store collection name.
    pub store_name: String,
    /// Adopted when nothing usable is stored.
    pub default: Vec<R>,
    /// Legacy synchronous key to migrate from and mirror into.
    pub legacy_key: Option<StorageKey>,
    pub debounce: Option<Duration>,
    pub sanitizer: Option<Sanitizer<Vec<R>>>,
}

impl<R> CollectionOptions<R> {
    pub fn new(store_name: impl Into<String>, default: Vec<R>) -> Self {
        Self {
            store_name: store_name.into(),
            default,
            legacy_key: None,
            debounce: None,
            sanitizer: None,
        }
    }

    pub fn legacy_key(mut self, key: StorageKey) -> Self {
        self.legacy_key = Some(key);
        self
    }

    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = Some(debounce);
        self
    }

    pub fn sanitizer(mut self, f: impl Fn(Vec<R>) -> Vec<R> + Send + Sync + 'static) -> Self {
        self.sanitizer = Some(Arc::new(f));
        self
    }
}

struct CollectionState<R> {
    data: Vec<R>,
    loading: bool,
    initialized: bool,
    source: LoadSource,
    guard: StateLossGuard,
    error: Option<Arc<CacheError>>,
}

/// Result of one load sequence, applied to the state in a single step.
struct Loaded<R> {
    data: Vec<R>,
    source: LoadSource,
    stored_items: usize,
    migrated: Option<usize>,
    error: Option<CacheError>,
}

/// A record collection kept in memory and persisted through a tiered
/// storage policy.
pub struct CollectionBinding<R: Record> {
    store_name: String,
    /// Key used in events and logs: the legacy key when there is one.
    event_key: String,
    default: Vec<R>,
    sanitizer: Option<Sanitizer<Vec<R>>>,
    kv: Arc<dyn KvStore>,
    records: Arc<dyn RecordStore>,
    tiers: TieredStorage,
    migration: Option<MigrationEntry>,
    state: Mutex<CollectionState<R>>,
    writer: Mutex<Debouncer<Vec<R>>>,
    write_lock: Mutex<()>,
    events: Arc<SubscriptionManager>,
}

impl<R: Record> CollectionBinding<R> {
    /// Mount a binding without loading. The default collection is visible
    /// until [`initialize`](Self::initialize) completes.
    pub fn mount(options: CollectionOptions<R>, ctx: &BindingContext) -> Self {
        let mut tiers = TieredStorage::new().with_tier(RecordStoreTier::new(Arc::clone(&ctx.records)));
        let mut migration = None;

        if let Some(legacy_key) = &options.legacy_key {
            tiers = tiers.with_tier(LegacyMirrorTier::new(
                Arc::clone(&ctx.kv),
                legacy_key.clone(),
                R::IDENTITY_FIELD,
            ));
            migration = Some(
                MigrationEntry::new(legacy_key.clone(), options.store_name.clone())
                    .with_identity_field(R::IDENTITY_FIELD),
            );
        }

        let event_key = options
            .legacy_key
            .as_ref()
            .map(|k| k.to_string())
            .unwrap_or_else(|| options.store_name.clone());

        Self {
            event_key,
            store_name: options.store_name,
            sanitizer: options.sanitizer,
            kv: Arc::clone(&ctx.kv),
            records: Arc::clone(&ctx.records),
            tiers,
            migration,
            state: Mutex::new(CollectionState {
                data: options.default.clone(),
                loading: false,
                initialized: false,
                source: LoadSource::Default,
                guard: StateLossGuard::new(),
                error: None,
            }),
            default: options.default,
            writer: Mutex::new(Debouncer::new(
                options.debounce.unwrap_or(ctx.debounce),
                Arc::clone(&ctx.clock),
            )),
            write_lock: Mutex::new(()),
            events: Arc::clone(&ctx.events),
        }
    }

    /// Run the load sequence on the calling thread.
    pub fn initialize(&self) {
        self.load();
    }

    /// Run the load sequence on a background thread.
    pub fn spawn_initialize(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        self.state.lock().loading = true;
        let binding = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("statecache-load-{}", self.store_name))
            .spawn(move || binding.load())?;
        Ok(handle)
    }

    /// Discard any pending write and run the load sequence again.
    pub fn refresh(&self) {
        if self.writer.lock().cancel().is_some() {
            debug!(collection = %self.store_name, "pending write discarded by refresh");
        }
        self.load();
    }

    fn load(&self) {
        self.state.lock().loading = true;
        let loaded = self.read_sequence();

        let items = loaded.data.len();
        {
            let mut state = self.state.lock();
            state.data = loaded.data;
            state.source = loaded.source.clone();
            state.guard = StateLossGuard::seeded_with_items(loaded.stored_items);
            state.error = loaded.error.map(Arc::new);
            state.loading = false;
            state.initialized = true;
        }

        if let Some(records) = loaded.migrated {
            self.events.publish(CacheEvent::Migrated {
                key: self.event_key.clone(),
                collection: self.store_name.clone(),
                items: records,
            });
        }
        self.events.publish(CacheEvent::Loaded {
            key: self.event_key.clone(),
            source: loaded.source,
            items,
        });
    }

    fn read_sequence(&self) -> Loaded<R> {
        let mut failure = None;
        let mut migrated = None;

        if let Some(entry) = &self.migration {
            match migrate_one(self.kv.as_ref(), self.records.as_ref(), entry) {
                Ok(MigrationStatus::Migrated { records, .. }) => migrated = Some(records),
                Ok(_) => {}
                Err(e) => {
                    warn!(collection = %self.store_name, error = %e, "migration failed");
                    failure = Some(e);
                }
            }
        }

        let read = self.tiers.read(&self.store_name);
        if failure.is_none() {
            failure = read.error;
        }

        let stored_items = read.records.len();
        let mut data: Vec<R> = read
            .records
            .into_iter()
            .filter_map(|record| match serde_json::from_value(record.body) {
                Ok(item) => Some(item),
                Err(e) => {
                    warn!(collection = %self.store_name, id = %record.id, error = %e, "undecodable record skipped");
                    None
                }
            })
            .collect();

        if let Some(sanitize) = &self.sanitizer {
            data = sanitize(data);
        }

        let source = match (read.source_index, read.source) {
            (Some(0), _) => LoadSource::Primary,
            (Some(_), Some(tier)) => LoadSource::Tier(tier),
            _ => LoadSource::Default,
        };

        if data.is_empty() {
            return Loaded {
                data: self.default.clone(),
                source: LoadSource::Default,
                stored_items,
                migrated,
                error: failure,
            };
        }

        info!(collection = %self.store_name, items = data.len(), source = ?source, "collection loaded");
        Loaded {
            data,
            source,
            stored_items,
            migrated,
            error: failure,
        }
    }

    pub fn store_name(&self) -> &str {
        &self.store_name
    }

    /// Snapshot of the in-memory collection.
    pub fn data(&self) -> Vec<R> {
        self.state.lock().data.clone()
    }

    pub fn with_data<T>(&self, f: impl FnOnce(&[R]) -> T) -> T {
        f(&self.state.lock().data)
    }

    pub fn len(&self) -> usize {
        self.state.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record with the given identity.
    pub fn item(&self, id: &str) -> Option<R> {
        self.state
            .lock()
            .data
            .iter()
            .find(|r| r.identity() == id)
            .cloned()
    }

    pub fn is_loading(&self) -> bool {
        self.state.lock().loading
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    pub fn source(&self) -> LoadSource {
        self.state.lock().source.clone()
    }

    /// Last load or write failure, cleared by the next success.
    pub fn error(&self) -> Option<Arc<CacheError>> {
        self.state.lock().error.clone()
    }

    pub fn is_pending(&self) -> bool {
        self.writer.lock().is_pending()
    }

    pub fn writer_stats(&self) -> DebounceStats {
        self.writer.lock().stats()
    }

    /// Replace the collection.
    ///
    /// Before initialization completes this only changes the in-memory
    /// value; the load sequence will overwrite it.
    pub fn set_data(&self, data: Vec<R>) {
        self.mutate(|items| {
            *items = data;
            Ok(())
        })
        .unwrap_or_default();
    }

    /// Modify the collection in place.
    pub fn update_data(&self, f: impl FnOnce(&mut Vec<R>)) {
        self.mutate(|items| {
            f(items);
            Ok(())
        })
        .unwrap_or_default();
    }

    /// Append a record. Its identity must be set and unused.
    pub fn add_item(&self, item: R) -> Result<()> {
        let id = item.identity().to_string();
        if id.is_empty() {
            return Err(CacheError::MissingIdentity {
                collection: self.store_name.clone(),
            });
        }

        self.mutate(|items| {
            if items.iter().any(|r| r.identity() == id) {
                return Err(CacheError::DuplicateIdentity {
                    collection: self.store_name.clone(),
                    identity: id,
                });
            }
            items.push(item);
            Ok(())
        })
    }

    /// Shallow-merge a JSON object into the record with `id`.
    ///
    /// The identity field is never overwritten. Returns false when no
    /// record matches.
    pub fn update_item(&self, id: &str, patch: Value) -> Result<bool> {
        let Value::Object(fields) = patch else {
            return Err(CacheError::Serialization(format!(
                "patch for {} in {} is not an object",
                id, self.store_name
            )));
        };

        self.mutate(|items| {
            let Some(slot) = items.iter_mut().find(|r| r.identity() == id) else {
                return Ok(false);
            };

            let mut merged = serde_json::to_value(&*slot)?;
            if let Value::Object(target) = &mut merged {
                for (field, value) in fields {
                    if field != R::IDENTITY_FIELD {
                        target.insert(field, value);
                    }
                }
            }
            *slot = serde_json::from_value(merged)
                .map_err(|e| CacheError::Deserialization(e.to_string()))?;
            Ok(true)
        })
    }

    /// Modify the record with `id` through a closure.
    ///
    /// Fails with `IdentityChanged`, leaving the record untouched, if the
    /// closure changes the identity.
    pub fn modify_item(&self, id: &str, f: impl FnOnce(&mut R)) -> Result<bool> {
        self.mutate(|items| {
            let Some(slot) = items.iter_mut().find(|r| r.identity() == id) else {
                return Ok(false);
            };

            let mut candidate = slot.clone();
            f(&mut candidate);
            if candidate.identity() != id {
                return Err(CacheError::IdentityChanged {
                    collection: self.store_name.clone(),
                    identity: id.to_string(),
                });
            }
            *slot = candidate;
            Ok(true)
        })
    }

    /// Remove the record with `id`. Returns whether it existed.
    pub fn delete_item(&self, id: &str) -> bool {
        self.mutate(|items| {
            let Some(pos) = items.iter().position(|r| r.identity() == id) else {
                return Ok(false);
            };
            items.remove(pos);
            Ok(true)
        })
        .unwrap_or_default()
    }

    /// Apply a change to the in-memory collection and schedule a write
    /// when the closure succeeds and reports a change.
    fn mutate<T>(&self, f: impl FnOnce(&mut Vec<R>) -> Result<T>) -> Result<T>
    where
        T: Changed,
    {
        let (result, snapshot) = {
            let mut state = self.state.lock();
            let result = f(&mut state.data)?;
            let snapshot = (state.initialized && result.changed()).then(|| state.data.clone());
            (result, snapshot)
        };

        if let Some(snapshot) = snapshot {
            if self.writer.lock().schedule(snapshot) {
                debug!(collection = %self.store_name, "superseded pending write");
            }
            self.events.publish(CacheEvent::Changed {
                key: self.event_key.clone(),
            });
        }
        Ok(result)
    }

    /// Fire the pending write if it is due.
    pub fn poll(&self) -> WriteOutcome {
        let due = self.writer.lock().take_due();
        match due {
            Some(snapshot) => self.persist(snapshot),
            None => WriteOutcome::Idle,
        }
    }

    /// Fire the pending write now.
    pub fn flush(&self) -> WriteOutcome {
        let pending = self.writer.lock().take_now();
        match pending {
            Some(snapshot) => self.persist(snapshot),
            None => WriteOutcome::Idle,
        }
    }

    /// Empty the collection in every tier immediately, bypassing the
    /// state-loss guard. The legacy backup slot is dropped as well.
    pub fn clear(&self) -> WriteOutcome {
        let _lock = self.write_lock.lock();
        self.writer.lock().cancel();
        self.state.lock().data.clear();

        if let Err(e) = self.tiers.clear(&self.store_name) {
            return self.fail(e);
        }

        {
            let mut state = self.state.lock();
            state.guard.confirm_items(0);
            state.error = None;
        }
        info!(collection = %self.store_name, "cleared on request");
        self.events.publish(CacheEvent::Persisted {
            key: self.event_key.clone(),
            items: 0,
        });
        WriteOutcome::Written {
            items: 0,
            backed_up: false,
        }
    }

    fn encode(&self, items: &[R]) -> Result<Vec<StoredRecord>> {
        items
            .iter()
            .map(|item| {
                let id = item.identity();
                if id.is_empty() {
                    return Err(CacheError::MissingIdentity {
                        collection: self.store_name.clone(),
                    });
                }
                Ok(StoredRecord::new(id, serde_json::to_value(item)?))
            })
            .collect()
    }

    fn persist(&self, snapshot: Vec<R>) -> WriteOutcome {
        let _lock = self.write_lock.lock();

        let records = match self.encode(&snapshot) {
            Ok(records) => records,
            Err(e) => return self.fail(e),
        };

        let verdict = self
            .state
            .lock()
            .guard
            .check(&self.event_key, records.is_empty(), false);
        if let Verdict::Block { previous_items } = verdict {
            self.events.publish(CacheEvent::WriteBlocked {
                key: self.event_key.clone(),
                previous_items,
            });
            return WriteOutcome::Blocked { previous_items };
        }

        let report = match self.tiers.write(&self.store_name, &records) {
            Ok(report) => report,
            Err(e) => return self.fail(e),
        };

        let items = records.len();
        {
            let mut state = self.state.lock();
            state.guard.confirm_items(items);
            state.error = None;
        }

        debug!(collection = %self.store_name, items, "persisted");
        self.events.publish(CacheEvent::Persisted {
            key: self.event_key.clone(),
            items,
        });

        WriteOutcome::Written {
            items,
            backed_up: report.backed_up(),
        }
    }

    fn fail(&self, e: CacheError) -> WriteOutcome {
        error!(collection = %self.store_name, error = %e, "write failed");
        self.events.publish(CacheEvent::WriteFailed {
            key: self.event_key.clone(),
            error: e.to_string(),
        });
        self.state.lock().error = Some(Arc::new(e));
        WriteOutcome::Failed
    }
}

/// Whether a mutation result means the collection changed.
trait Changed: Default {
    fn changed(&self) -> bool;
}

impl Changed for () {
    fn changed(&self) -> bool {
        true
    }
}

impl Changed for bool {
    fn changed(&self) -> bool {
        *self
    }
}

impl<R: Record> Flushable for CollectionBinding<R> {
    fn flush_key(&self) -> &str {
        &self.event_key
    }

    fn poll_due(&self) -> WriteOutcome {
        self.poll()
    }

    fn flush_now(&self) -> WriteOutcome {
        self.flush()
    }
}

impl<R: Record> Drop for CollectionBinding<R> {
    fn drop(&mut self) {
        if let Some(snapshot) = self.writer.get_mut().take_now() {
            self.persist(snapshot);
        }
    }
}
