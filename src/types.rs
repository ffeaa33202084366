//! Core types for the state cache.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Suffix appended to a logical key to address its backup slot.
pub const BACKUP_SUFFIX: &str = "_backup";

/// Identity field assumed when a caller does not name one.
pub const DEFAULT_IDENTITY_FIELD: &str = "id";

/// Fixed application prefix shared by every persisted key.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace(String);

impl Namespace {
    pub fn new(name: impl Into<String>) -> Self {
        Namespace(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key prefix including the separator (e.g. `app_`).
    pub fn prefix(&self) -> String {
        format!("{}_", self.0)
    }

    /// Namespaced logical key for an entity.
    pub fn key(&self, entity: &str) -> StorageKey {
        StorageKey(format!("{}_{}", self.0, entity))
    }

    /// Whether a raw key belongs to this namespace.
    pub fn owns(&self, raw: &str) -> bool {
        raw.len() > self.0.len() + 1 && raw.starts_with(&self.prefix())
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Namespace({})", self.0)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A namespaced logical key. Stable across sessions.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StorageKey(pub String);

impl StorageKey {
    pub fn new(raw: impl Into<String>) -> Self {
        StorageKey(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The shadow slot holding the last known-good non-empty value.
    pub fn backup(&self) -> StorageKey {
        StorageKey(format!("{}{}", self.0, BACKUP_SUFFIX))
    }

    pub fn is_backup(&self) -> bool {
        self.0.ends_with(BACKUP_SUFFIX)
    }

    /// Primary key for a backup key, `None` if this is not a backup key.
    pub fn primary(&self) -> Option<StorageKey> {
        self.0
            .strip_suffix(BACKUP_SUFFIX)
            .map(|p| StorageKey(p.to_string()))
    }
}

impl fmt::Debug for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorageKey({})", self.0)
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StorageKey {
    fn from(s: &str) -> Self {
        StorageKey(s.to_string())
    }
}

/// An entity living inside a collection.
///
/// The identity is assigned by the caller before the record reaches a
/// binding and never changes afterwards.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Name of the serialized identity field.
    const IDENTITY_FIELD: &'static str = DEFAULT_IDENTITY_FIELD;

    fn identity(&self) -> &str;
}

/// Read the identity of an encoded record.
///
/// String and integer identities are accepted; integers are stringified.
pub fn identity_of(value: &serde_json::Value, field: &str) -> Option<String> {
    match value.get(field)? {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Where a binding's loaded value came from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadSource {
    /// The primary slot parsed cleanly.
    Primary,
    /// The primary slot was missing or corrupt; the backup slot was used.
    Backup,
    /// A storage tier other than the first one supplied the data.
    Tier(String),
    /// Nothing usable was stored.
    Default,
}

/// Result of firing one debounced write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The value reached the store of record.
    Written { items: usize, backed_up: bool },
    /// The state-loss guard refused an empty-over-non-empty write.
    Blocked { previous_items: usize },
    /// The write failed; the binding's error holds the cause.
    Failed,
    /// Nothing was pending.
    Idle,
}

impl WriteOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, WriteOutcome::Written { .. })
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, WriteOutcome::Blocked { .. })
    }
}

/// Size and item count of one stored slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotStats {
    pub present: bool,
    pub bytes: usize,
    pub items: usize,
}
