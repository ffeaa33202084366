//! Scalar binding: one value in the synchronous store plus its backup slot.

use super::{BindingContext, Sanitizer};
use crate::codec::{Codec, JsonCodec};
use crate::debounce::{DebounceStats, Debouncer};
use crate::error::CacheError;
use crate::guard::{is_empty_encoded, item_count, StateLossGuard, Verdict};
use crate::kv::KvStore;
use crate::scheduler::Flushable;
use crate::subscriptions::{CacheEvent, SubscriptionManager};
use crate::types::{LoadSource, StorageKey, WriteOutcome};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Options for mounting a scalar binding.
pub struct ScalarOptions<T, C = JsonCodec<T>> {
    pub key: StorageKey,
    pub default: T,
    pub codec: C,
    pub sanitizer: Option<Sanitizer<T>>,
    /// Overrides the context's quiet period.
    pub debounce: Option<Duration>,
}

impl<T> ScalarOptions<T, JsonCodec<T>> {
    pub fn new(key: StorageKey, default: T) -> Self {
        Self {
            key,
            default,
            codec: JsonCodec::new(),
            sanitizer: None,
            debounce: None,
        }
    }
}

impl<T, C> ScalarOptions<T, C> {
    pub fn sanitizer(mut self, f: impl Fn(T) -> T + Send + Sync + 'static) -> Self {
        self.sanitizer = Some(Arc::new(f));
        self
    }

    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = Some(debounce);
        self
    }

    pub fn with_codec<C2>(self, codec: C2) -> ScalarOptions<T, C2> {
        ScalarOptions {
            key: self.key,
            default: self.default,
            codec,
            sanitizer: self.sanitizer,
            debounce: self.debounce,
        }
    }
}

/// Result of loading a scalar slot.
#[derive(Clone, Debug)]
pub struct ScalarLoad<T> {
    pub value: T,
    pub source: LoadSource,
    /// Encoded value that was read, if any slot was usable.
    pub raw: Option<String>,
}

/// Decode one slot. Missing, unreadable and corrupt slots all yield `None`.
fn read_slot<T, C: Codec<T>>(kv: &dyn KvStore, key: &StorageKey, codec: &C) -> Option<(T, String)> {
    let raw = match kv.get(key.as_str()) {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(e) => {
            warn!(key = %key, error = %e, "slot unreadable");
            return None;
        }
    };

    match codec.decode(&raw) {
        Ok(value) => Some((value, raw)),
        Err(e) => {
            warn!(key = %key, error = %e, "slot holds a corrupt value");
            None
        }
    }
}

/// Load a scalar: primary slot, then backup slot (repairing the primary),
/// then the default. The sanitizer runs on whichever stored value is used.
pub fn load_scalar<T: Clone, C: Codec<T>>(
    kv: &dyn KvStore,
    key: &StorageKey,
    default: &T,
    codec: &C,
    sanitizer: Option<&Sanitizer<T>>,
) -> ScalarLoad<T> {
    let sanitize = |value: T| match sanitizer {
        Some(f) => f(value),
        None => value,
    };

    if let Some((value, raw)) = read_slot(kv, key, codec) {
        return ScalarLoad {
            value: sanitize(value),
            source: LoadSource::Primary,
            raw: Some(raw),
        };
    }

    if let Some((value, raw)) = read_slot(kv, &key.backup(), codec) {
        match kv.set(key.as_str(), &raw) {
            Ok(()) => info!(key = %key, items = item_count(&raw), "repaired primary slot from backup"),
            Err(e) => warn!(key = %key, error = %e, "could not repair primary slot from backup"),
        }
        return ScalarLoad {
            value: sanitize(value),
            source: LoadSource::Backup,
            raw: Some(raw),
        };
    }

    ScalarLoad {
        value: default.clone(),
        source: LoadSource::Default,
        raw: None,
    }
}

struct ScalarState<T> {
    value: T,
    source: LoadSource,
    guard: StateLossGuard,
    error: Option<Arc<CacheError>>,
}

/// A value kept in memory and persisted to a primary slot and its backup.
pub struct ScalarBinding<T, C = JsonCodec<T>>
where
    T: Clone + Send + Sync + 'static,
    C: Codec<T>,
{
    key: StorageKey,
    kv: Arc<dyn KvStore>,
    codec: C,
    default: T,
    sanitizer: Option<Sanitizer<T>>,
    state: Mutex<ScalarState<T>>,
    writer: Mutex<Debouncer<T>>,
    /// Serializes writes for this key.
    write_lock: Mutex<()>,
    events: Arc<SubscriptionManager>,
}

impl<T, C> ScalarBinding<T, C>
where
    T: Clone + Send + Sync + 'static,
    C: Codec<T>,
{
    /// Mount a binding, loading its current value synchronously.
    pub fn mount(options: ScalarOptions<T, C>, ctx: &BindingContext) -> Self {
        let debounce = options.debounce.unwrap_or(ctx.debounce);
        let loaded = load_scalar(
            ctx.kv.as_ref(),
            &options.key,
            &options.default,
            &options.codec,
            options.sanitizer.as_ref(),
        );
        let guard = Self::guard_for(&options.codec, &loaded);

        let binding = Self {
            key: options.key,
            kv: Arc::clone(&ctx.kv),
            codec: options.codec,
            default: options.default,
            sanitizer: options.sanitizer,
            state: Mutex::new(ScalarState {
                value: loaded.value,
                source: loaded.source.clone(),
                guard,
                error: None,
            }),
            writer: Mutex::new(Debouncer::new(debounce, Arc::clone(&ctx.clock))),
            write_lock: Mutex::new(()),
            events: Arc::clone(&ctx.events),
        };

        binding.publish_loaded(loaded.source, loaded.raw.as_deref());
        binding
    }

    fn guard_for(codec: &C, loaded: &ScalarLoad<T>) -> StateLossGuard {
        match &loaded.raw {
            Some(raw) => StateLossGuard::seeded(raw),
            None => codec
                .encode(&loaded.value)
                .map(|raw| StateLossGuard::seeded(&raw))
                .unwrap_or_default(),
        }
    }

    fn publish_loaded(&self, source: LoadSource, raw: Option<&str>) {
        self.events.publish(CacheEvent::Loaded {
            key: self.key.to_string(),
            source,
            items: raw.map(item_count).unwrap_or(0),
        });
    }

    pub fn key(&self) -> &StorageKey {
        &self.key
    }

    /// Current in-memory value.
    pub fn get(&self) -> T {
        self.state.lock().value.clone()
    }

    /// Borrow the in-memory value.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.state.lock().value)
    }

    /// Where the last load found its value.
    pub fn source(&self) -> LoadSource {
        self.state.lock().source.clone()
    }

    /// Last write failure, cleared by the next successful write.
    pub fn error(&self) -> Option<Arc<CacheError>> {
        self.state.lock().error.clone()
    }

    /// Replace the value and schedule a write.
    pub fn set(&self, value: T) {
        self.state.lock().value = value.clone();
        self.schedule(value);
    }

    /// Modify the value in place and schedule a write.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let snapshot = {
            let mut state = self.state.lock();
            f(&mut state.value);
            state.value.clone()
        };
        self.schedule(snapshot);
    }

    fn schedule(&self, snapshot: T) {
        if self.writer.lock().schedule(snapshot) {
            debug!(key = %self.key, "superseded pending write");
        }
        self.events.publish(CacheEvent::Changed {
            key: self.key.to_string(),
        });
    }

    /// Whether a write is waiting for its quiet period.
    pub fn is_pending(&self) -> bool {
        self.writer.lock().is_pending()
    }

    pub fn writer_stats(&self) -> DebounceStats {
        self.writer.lock().stats()
    }

    /// Fire the pending write if it is due.
    pub fn poll(&self) -> WriteOutcome {
        let due = self.writer.lock().take_due();
        match due {
            Some(snapshot) => self.persist(snapshot, false),
            None => WriteOutcome::Idle,
        }
    }

    /// Fire the pending write now.
    pub fn flush(&self) -> WriteOutcome {
        let pending = self.writer.lock().take_now();
        match pending {
            Some(snapshot) => self.persist(snapshot, false),
            None => WriteOutcome::Idle,
        }
    }

    /// Persist `T::default()` immediately, bypassing the state-loss guard,
    /// and drop the backup slot.
    pub fn clear(&self) -> WriteOutcome
    where
        T: Default,
    {
        self.writer.lock().cancel();
        let empty = T::default();
        self.state.lock().value = empty.clone();

        let outcome = self.persist(empty, true);
        if outcome.is_written() {
            if let Err(e) = self.kv.remove(self.key.backup().as_str()) {
                warn!(key = %self.key, error = %e, "could not drop backup slot");
            }
            info!(key = %self.key, "cleared on request");
        }
        outcome
    }

    /// Discard any pending write and load again from storage.
    pub fn reload(&self) -> LoadSource {
        self.writer.lock().cancel();
        let loaded = load_scalar(
            self.kv.as_ref(),
            &self.key,
            &self.default,
            &self.codec,
            self.sanitizer.as_ref(),
        );
        let guard = Self::guard_for(&self.codec, &loaded);

        {
            let mut state = self.state.lock();
            state.value = loaded.value;
            state.source = loaded.source.clone();
            state.guard = guard;
        }

        self.publish_loaded(loaded.source.clone(), loaded.raw.as_deref());
        loaded.source
    }

    fn persist(&self, value: T, force: bool) -> WriteOutcome {
        let _lock = self.write_lock.lock();

        let encoded = match self.codec.encode(&value) {
            Ok(encoded) => encoded,
            Err(e) => return self.fail(e),
        };
        let is_empty = is_empty_encoded(&encoded);

        let verdict = self.state.lock().guard.check(self.key.as_str(), is_empty, force);
        if let Verdict::Block { previous_items } = verdict {
            self.events.publish(CacheEvent::WriteBlocked {
                key: self.key.to_string(),
                previous_items,
            });
            return WriteOutcome::Blocked { previous_items };
        }

        if let Err(e) = self.kv.set(self.key.as_str(), &encoded) {
            return self.fail(e);
        }

        let mut backed_up = false;
        if !is_empty {
            match self.kv.set(self.key.backup().as_str(), &encoded) {
                Ok(()) => backed_up = true,
                Err(e) => debug!(key = %self.key, error = %e, "backup write skipped"),
            }
        }

        let items = item_count(&encoded);
        {
            let mut state = self.state.lock();
            state.guard.confirm_encoded(&encoded);
            state.error = None;
        }

        debug!(key = %self.key, bytes = encoded.len(), items, backed_up, "persisted");
        self.events.publish(CacheEvent::Persisted {
            key: self.key.to_string(),
            items,
        });

        WriteOutcome::Written { items, backed_up }
    }

    fn fail(&self, e: CacheError) -> WriteOutcome {
        error!(key = %self.key, error = %e, "write failed");
        self.events.publish(CacheEvent::WriteFailed {
            key: self.key.to_string(),
            error: e.to_string(),
        });
        self.state.lock().error = Some(Arc::new(e));
        WriteOutcome::Failed
    }
}

impl<T, C> Flushable for ScalarBinding<T, C>
where
    T: Clone + Send + Sync + 'static,
    C: Codec<T>,
{
    fn flush_key(&self) -> &str {
        self.key.as_str()
    }

    fn poll_due(&self) -> WriteOutcome {
        self.poll()
    }

    fn flush_now(&self) -> WriteOutcome {
        self.flush()
    }
}

impl<T, C> Drop for ScalarBinding<T, C>
where
    T: Clone + Send + Sync + 'static,
    C: Codec<T>,
{
    fn drop(&mut self) {
        if let Some(snapshot) = self.writer.get_mut().take_now() {
            self.persist(snapshot, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::kv::MemoryKvStore;
    use crate::records::MemoryRecordStore;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Goal {
        id: String,
        target: u32,
    }

    fn goal(id: &str) -> Goal {
        Goal {
            id: id.to_string(),
            target: 10,
        }
    }

    fn context(kv: &Arc<MemoryKvStore>, clock: &ManualClock) -> BindingContext {
        BindingContext::new(kv.clone(), Arc::new(MemoryRecordStore::new()))
            .with_clock(Arc::new(clock.clone()))
    }

    fn goals(ctx: &BindingContext) -> ScalarBinding<Vec<Goal>> {
        ScalarBinding::mount(
            ScalarOptions::new(StorageKey::from("app_goals"), Vec::new()),
            ctx,
        )
    }

    #[test]
    fn test_fresh_install_uses_default() {
        let kv = Arc::new(MemoryKvStore::new());
        let clock = ManualClock::new();
        let binding = goals(&context(&kv, &clock));

        assert!(binding.get().is_empty());
        assert_eq!(binding.source(), LoadSource::Default);
        assert!(kv.get("app_goals").unwrap().is_none());
    }

    #[test]
    fn test_write_fires_after_quiet_period() {
        let kv = Arc::new(MemoryKvStore::new());
        let clock = ManualClock::new();
        let binding = goals(&context(&kv, &clock));

        binding.set(vec![goal("g1")]);
        assert_eq!(binding.poll(), WriteOutcome::Idle);
        assert!(kv.get("app_goals").unwrap().is_none());

        clock.advance(Duration::from_millis(500));
        assert_eq!(
            binding.poll(),
            WriteOutcome::Written {
                items: 1,
                backed_up: true
            }
        );
        assert_eq!(item_count(&kv.get("app_goals").unwrap().unwrap()), 1);
        assert_eq!(item_count(&kv.get("app_goals_backup").unwrap().unwrap()), 1);
    }

    #[test]
    fn test_burst_writes_once() {
        let kv = Arc::new(MemoryKvStore::new());
        let clock = ManualClock::new();
        let binding = goals(&context(&kv, &clock));

        for i in 0..5 {
            binding.update(|g| g.push(goal(&format!("g{}", i))));
            clock.advance(Duration::from_millis(100));
        }
        clock.advance(Duration::from_millis(500));
        assert!(binding.poll().is_written());
        assert_eq!(binding.poll(), WriteOutcome::Idle);

        // One primary write plus one backup write.
        assert_eq!(kv.writes(), 2);
        assert_eq!(item_count(&kv.get("app_goals").unwrap().unwrap()), 5);
        assert_eq!(binding.writer_stats().fired, 1);
    }

    #[test]
    fn test_empty_write_blocked() {
        let kv = Arc::new(MemoryKvStore::new());
        kv.set("app_goals", r#"[{"id":"g1","target":1},{"id":"g2","target":2}]"#)
            .unwrap();
        let clock = ManualClock::new();
        let binding = goals(&context(&kv, &clock));

        binding.set(Vec::new());
        assert_eq!(
            binding.flush(),
            WriteOutcome::Blocked { previous_items: 2 }
        );
        assert!(binding.get().is_empty());
        assert_eq!(item_count(&kv.get("app_goals").unwrap().unwrap()), 2);
    }

    #[test]
    fn test_clear_bypasses_guard() {
        let kv = Arc::new(MemoryKvStore::new());
        kv.set("app_goals", r#"[{"id":"g1","target":1}]"#).unwrap();
        kv.set("app_goals_backup", r#"[{"id":"g1","target":1}]"#).unwrap();
        let clock = ManualClock::new();
        let binding = goals(&context(&kv, &clock));

        assert!(binding.clear().is_written());
        assert_eq!(kv.get("app_goals").unwrap().as_deref(), Some("[]"));
        assert!(kv.get("app_goals_backup").unwrap().is_none());

        // Reload sees the cleared value rather than resurrecting the backup.
        assert_eq!(binding.reload(), LoadSource::Primary);
        assert!(binding.get().is_empty());
    }

    #[test]
    fn test_corrupt_primary_recovers_from_backup() {
        let kv = Arc::new(MemoryKvStore::new());
        kv.set("app_goals", "[{\"id\":").unwrap();
        kv.set("app_goals_backup", r#"[{"id":"g1","target":3}]"#).unwrap();
        let clock = ManualClock::new();
        let binding = goals(&context(&kv, &clock));

        assert_eq!(binding.source(), LoadSource::Backup);
        assert_eq!(binding.get(), vec![Goal { id: "g1".into(), target: 3 }]);
        assert_eq!(
            kv.get("app_goals").unwrap(),
            kv.get("app_goals_backup").unwrap()
        );
    }

    #[test]
    fn test_sanitizer_applies_to_backup_path() {
        let kv = Arc::new(MemoryKvStore::new());
        kv.set("app_goals_backup", r#"[{"id":"g1","target":3},{"id":"","target":0}]"#)
            .unwrap();
        let clock = ManualClock::new();
        let ctx = context(&kv, &clock);
        let binding: ScalarBinding<Vec<Goal>> = ScalarBinding::mount(
            ScalarOptions::new(StorageKey::from("app_goals"), Vec::new())
                .sanitizer(|goals: Vec<Goal>| goals.into_iter().filter(|g| !g.id.is_empty()).collect()),
            &ctx,
        );
        assert_eq!(binding.get().len(), 1);
    }

    #[test]
    fn test_quota_failure_surfaces_error() {
        let kv = Arc::new(MemoryKvStore::with_capacity(40));
        let clock = ManualClock::new();
        let binding = goals(&context(&kv, &clock));

        binding.set((0..10).map(|i| goal(&format!("g{}", i))).collect());
        assert_eq!(binding.flush(), WriteOutcome::Failed);
        assert!(matches!(
            binding.error().as_deref(),
            Some(CacheError::QuotaExceeded { .. })
        ));
        // The in-memory value is still usable.
        assert_eq!(binding.get().len(), 10);

        binding.set(vec![goal("a")]);
        assert!(binding.flush().is_written());
        assert!(binding.error().is_none());
    }

    #[test]
    fn test_backup_quota_is_tolerated() {
        // Room for the primary slot but not for its backup.
        let kv = Arc::new(MemoryKvStore::with_capacity(60));
        let clock = ManualClock::new();
        let binding = goals(&context(&kv, &clock));

        binding.set(vec![goal("g1")]);
        assert_eq!(
            binding.flush(),
            WriteOutcome::Written {
                items: 1,
                backed_up: false
            }
        );
        assert!(binding.error().is_none());
    }

    #[test]
    fn test_drop_flushes_pending() {
        let kv = Arc::new(MemoryKvStore::new());
        let clock = ManualClock::new();
        {
            let binding = goals(&context(&kv, &clock));
            binding.set(vec![goal("g1")]);
        }
        assert_eq!(item_count(&kv.get("app_goals").unwrap().unwrap()), 1);
    }

    #[test]
    fn test_scalar_settings_object() {
        let kv = Arc::new(MemoryKvStore::new());
        let clock = ManualClock::new();
        let ctx = context(&kv, &clock);
        let binding: ScalarBinding<serde_json::Value> = ScalarBinding::mount(
            ScalarOptions::new(StorageKey::from("app_settings"), serde_json::json!({})),
            &ctx,
        );

        binding.set(serde_json::json!({"currency": "IDR", "targets": {"daily": 5}}));
        assert!(binding.flush().is_written());

        let reloaded: ScalarBinding<serde_json::Value> = ScalarBinding::mount(
            ScalarOptions::new(StorageKey::from("app_settings"), serde_json::json!({})),
            &ctx,
        );
        assert_eq!(reloaded.get()["targets"]["daily"], 5);
    }
}
