//! Subscription types for cache change events.

use crate::types::LoadSource;
use serde::{Deserialize, Serialize};

/// Configuration for a subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Max buffered events before dropping subscriber.
    /// Default: 1000
    pub buffer_size: usize,

    /// Filter criteria.
    pub filter: SubscriptionFilter,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            filter: SubscriptionFilter::default(),
        }
    }
}

/// Filter criteria for subscriptions.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionFilter {
    /// Only events for these keys (None = all keys).
    pub keys: Option<Vec<String>>,

    /// Include write diagnostics (blocked and failed writes).
    pub include_diagnostics: bool,
}

impl SubscriptionFilter {
    /// Everything for every key.
    pub fn all() -> Self {
        Self {
            keys: None,
            include_diagnostics: true,
        }
    }

    /// Everything for specific keys.
    pub fn keys(keys: Vec<String>) -> Self {
        Self {
            keys: Some(keys),
            include_diagnostics: true,
        }
    }

    pub(crate) fn matches(&self, event: &CacheEvent) -> bool {
        if event.is_diagnostic() && !self.include_diagnostics {
            return false;
        }
        match (&self.keys, event.key()) {
            (Some(keys), Some(key)) => keys.iter().any(|k| k == key),
            _ => true,
        }
    }
}

/// Events emitted to subscribers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheEvent {
    /// A binding finished loading.
    Loaded {
        key: String,
        source: LoadSource,
        items: usize,
    },

    /// The in-memory value changed; a write is pending.
    Changed { key: String },

    /// A pending write reached storage.
    Persisted { key: String, items: usize },

    /// The state-loss guard refused an empty write.
    WriteBlocked { key: String, previous_items: usize },

    /// A write failed; the previous persisted value stays authoritative.
    WriteFailed { key: String, error: String },

    /// A primary slot was restored from its backup.
    Restored { key: String, items: usize },

    /// Legacy data was copied into the record store.
    Migrated {
        key: String,
        collection: String,
        items: usize,
    },

    /// Backup slots were purged.
    BackupsCleared { count: usize },

    /// An export document was written back into storage.
    Imported { keys: usize },

    /// Subscription was dropped.
    Dropped { reason: DropReason },
}

impl CacheEvent {
    /// The key this event concerns, if it concerns exactly one.
    pub fn key(&self) -> Option<&str> {
        match self {
            CacheEvent::Loaded { key, .. }
            | CacheEvent::Changed { key, .. }
            | CacheEvent::Persisted { key, .. }
            | CacheEvent::WriteBlocked { key, .. }
            | CacheEvent::WriteFailed { key, .. }
            | CacheEvent::Restored { key, .. }
            | CacheEvent::Migrated { key, .. } => Some(key),
            CacheEvent::BackupsCleared { .. }
            | CacheEvent::Imported { .. }
            | CacheEvent::Dropped { .. } => None,
        }
    }

    fn is_diagnostic(&self) -> bool {
        matches!(
            self,
            CacheEvent::WriteBlocked { .. } | CacheEvent::WriteFailed { .. }
        )
    }
}

/// Why a subscription was dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Handle to manage a subscription.
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<CacheEvent>,
}

impl SubscriptionHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<CacheEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<CacheEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<CacheEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently buffered.
    pub fn drain(&self) -> Vec<CacheEvent> {
        self.receiver.try_iter().collect()
    }
}
