//! Emptiness heuristics and the state-loss guard.
//!
//! A value counts as empty when it is an empty array, an empty object, or
//! falsy (`null`, `false`, `0`, `""`). The guard refuses to persist an
//! empty value over a previously confirmed non-empty one unless the caller
//! explicitly forces it.

use serde_json::Value;
use tracing::warn;

/// Whether a decoded JSON value is empty.
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64().map(|f| f == 0.0).unwrap_or(false),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
    }
}

/// Whether an encoded value is empty.
///
/// Non-JSON encodings only count as empty when the encoded string is.
pub fn is_empty_encoded(raw: &str) -> bool {
    if raw.trim().is_empty() {
        return true;
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => is_empty_value(&value),
        Err(_) => false,
    }
}

/// Item count of an encoded value: array length when it parses as an
/// array, otherwise 0. Never fails.
pub fn item_count(raw: &str) -> usize {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(items)) => items.len(),
        _ => 0,
    }
}

/// Item count used by the guard for a value that is known to be non-empty.
fn weight(raw: &str) -> usize {
    item_count(raw).max(1)
}

/// Verdict for one pending write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Block { previous_items: usize },
}

/// Tracks the last confirmed persisted state of one key.
#[derive(Clone, Debug, Default)]
pub struct StateLossGuard {
    /// Items in the last confirmed non-empty value; 0 when empty or unknown.
    confirmed_items: usize,
    blocked: u64,
}

impl StateLossGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from an already-encoded value (the value a binding loaded).
    pub fn seeded(raw: &str) -> Self {
        let mut guard = Self::new();
        guard.confirm_encoded(raw);
        guard
    }

    /// Seed from a known item count.
    pub fn seeded_with_items(items: usize) -> Self {
        Self {
            confirmed_items: items,
            blocked: 0,
        }
    }

    /// Check a write whose emptiness is already known.
    pub fn check(&mut self, key: &str, new_is_empty: bool, force: bool) -> Verdict {
        if new_is_empty && self.confirmed_items > 0 && !force {
            self.blocked += 1;
            warn!(
                key = %key,
                previous_items = self.confirmed_items,
                "refusing to overwrite non-empty state with an empty value"
            );
            return Verdict::Block {
                previous_items: self.confirmed_items,
            };
        }
        Verdict::Allow
    }

    /// Record an encoded value as persisted.
    pub fn confirm_encoded(&mut self, raw: &str) {
        self.confirmed_items = if is_empty_encoded(raw) { 0 } else { weight(raw) };
    }

    /// Record a persisted collection of `items` records.
    pub fn confirm_items(&mut self, items: usize) {
        self.confirmed_items = items;
    }

    pub fn confirmed_items(&self) -> usize {
        self.confirmed_items
    }

    /// Number of writes this guard has refused.
    pub fn blocked(&self) -> u64 {
        self.blocked
    }
}
