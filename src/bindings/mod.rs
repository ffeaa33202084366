//! Reactive bindings between in-memory state and persistent storage.
//!
//! - [`ScalarBinding`]: one value in the synchronous store, shadowed by a
//!   backup slot.
//! - [`CollectionBinding`]: a record collection in the record store,
//!   mirrored into a legacy synchronous key.
//!
//! Both keep an in-memory value that is always the freshest copy and
//! persist it through a per-key debounced writer guarded against
//! empty-over-non-empty transitions.

mod collection;
mod scalar;

pub use collection::{CollectionBinding, CollectionOptions};
pub use scalar::{load_scalar, ScalarBinding, ScalarLoad, ScalarOptions};

use crate::clock::{Clock, SystemClock};
use crate::kv::KvStore;
use crate::records::RecordStore;
use crate::subscriptions::SubscriptionManager;
use std::sync::Arc;
use std::time::Duration;

/// Transform applied to every loaded value before it is adopted.
pub type Sanitizer<T> = Arc<dyn Fn(T) -> T + Send + Sync>;

/// Shared handles every binding is constructed with.
#[derive(Clone)]
pub struct BindingContext {
    pub kv: Arc<dyn KvStore>,
    pub records: Arc<dyn RecordStore>,
    pub clock: Arc<dyn Clock>,
    pub events: Arc<SubscriptionManager>,
    /// Default quiet period for bindings that don't set their own.
    pub debounce: Duration,
}

impl BindingContext {
    pub fn new(kv: Arc<dyn KvStore>, records: Arc<dyn RecordStore>) -> Self {
        Self {
            kv,
            records,
            clock: Arc::new(SystemClock),
            events: Arc::new(SubscriptionManager::new()),
            debounce: Duration::from_millis(500),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_events(mut self, events: Arc<SubscriptionManager>) -> Self {
        self.events = events;
        self
    }
}
