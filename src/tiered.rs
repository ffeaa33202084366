//! Tiered storage policy for collections.
//!
//! An ordered list of backends. Reads fall through the tiers until one
//! returns a non-empty collection and repair the tiers above it. Writes fan
//! out to every tier; only required tiers can fail a write.

use crate::error::{CacheError, Result};
use crate::kv::KvStore;
use crate::migration::read_legacy;
use crate::records::{RecordStore, StoredRecord};
use crate::types::StorageKey;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One storage backend for collections.
pub trait StorageTier: Send + Sync {
    fn name(&self) -> &str;

    /// Whether a failed write to this tier fails the whole write.
    fn required(&self) -> bool;

    /// Read a collection. Empty when nothing is stored.
    fn read(&self, collection: &str) -> Result<Vec<StoredRecord>>;

    /// Replace a collection. Returns whether a shadow backup copy was
    /// written alongside.
    fn write(&self, collection: &str, records: &[StoredRecord]) -> Result<bool>;

    /// Remove a collection, including any shadow copies.
    fn clear(&self, collection: &str) -> Result<()>;
}

/// The record store as the authoritative tier.
pub struct RecordStoreTier {
    store: Arc<dyn RecordStore>,
}

impl RecordStoreTier {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

impl StorageTier for RecordStoreTier {
    fn name(&self) -> &str {
        "record_store"
    }

    fn required(&self) -> bool {
        true
    }

    fn read(&self, collection: &str) -> Result<Vec<StoredRecord>> {
        self.store.get_all(collection)
    }

    fn write(&self, collection: &str, records: &[StoredRecord]) -> Result<bool> {
        self.store.replace_all(collection, records.to_vec())?;
        Ok(false)
    }

    fn clear(&self, collection: &str) -> Result<()> {
        self.store.clear(collection)
    }
}

/// Best-effort mirror of a collection into a legacy synchronous key and
/// its backup slot.
pub struct LegacyMirrorTier {
    kv: Arc<dyn KvStore>,
    key: StorageKey,
    identity_field: String,
}

impl LegacyMirrorTier {
    pub fn new(kv: Arc<dyn KvStore>, key: StorageKey, identity_field: impl Into<String>) -> Self {
        Self {
            kv,
            key,
            identity_field: identity_field.into(),
        }
    }

    pub fn key(&self) -> &StorageKey {
        &self.key
    }
}

impl StorageTier for LegacyMirrorTier {
    fn name(&self) -> &str {
        "legacy_mirror"
    }

    fn required(&self) -> bool {
        false
    }

    fn read(&self, _collection: &str) -> Result<Vec<StoredRecord>> {
        Ok(read_legacy(self.kv.as_ref(), &self.key, &self.identity_field)
            .map(|legacy| legacy.records)
            .unwrap_or_default())
    }

    fn write(&self, _collection: &str, records: &[StoredRecord]) -> Result<bool> {
        let bodies: Vec<&serde_json::Value> = records.iter().map(|r| &r.body).collect();
        let encoded = serde_json::to_string(&bodies)?;

        self.kv.set(self.key.as_str(), &encoded)?;

        if records.is_empty() {
            return Ok(false);
        }
        match self.kv.set(self.key.backup().as_str(), &encoded) {
            Ok(()) => Ok(true),
            Err(e) => {
                debug!(key = %self.key, error = %e, "backup mirror write failed");
                Ok(false)
            }
        }
    }

    fn clear(&self, _collection: &str) -> Result<()> {
        self.kv.set(self.key.as_str(), "[]")?;
        self.kv.remove(self.key.backup().as_str())?;
        Ok(())
    }
}

/// Outcome of a tiered read.
#[derive(Debug, Default)]
pub struct TierRead {
    pub records: Vec<StoredRecord>,
    /// Name of the tier that supplied the records, if any did.
    pub source: Option<String>,
    /// Position of that tier in the list.
    pub source_index: Option<usize>,
    /// Whether higher tiers were repaired from a lower one.
    pub healed: bool,
    /// First failure of a required tier.
    pub error: Option<CacheError>,
}

/// What one tier did with a fanned-out operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TierStatus {
    Written { backed_up: bool },
    Failed(String),
}

/// Per-tier results of a write, in tier order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FanOut {
    pub tiers: Vec<(String, TierStatus)>,
}

impl FanOut {
    /// Whether any tier wrote a shadow backup copy.
    pub fn backed_up(&self) -> bool {
        self.tiers
            .iter()
            .any(|(_, status)| matches!(status, TierStatus::Written { backed_up: true }))
    }

    /// Names of the tiers that failed.
    pub fn failed(&self) -> Vec<&str> {
        self.tiers
            .iter()
            .filter(|(_, status)| matches!(status, TierStatus::Failed(_)))
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Ordered list of tiers.
#[derive(Default)]
pub struct TieredStorage {
    tiers: Vec<Box<dyn StorageTier>>,
}

impl TieredStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tier(mut self, tier: impl StorageTier + 'static) -> Self {
        self.tiers.push(Box::new(tier));
        self
    }

    pub fn tier_names(&self) -> Vec<&str> {
        self.tiers.iter().map(|t| t.name()).collect()
    }

    /// Read from the first tier holding a non-empty collection.
    pub fn read(&self, collection: &str) -> TierRead {
        let mut result = TierRead::default();

        for (index, tier) in self.tiers.iter().enumerate() {
            match tier.read(collection) {
                Ok(records) if !records.is_empty() => {
                    if index > 0 {
                        result.healed = self.heal(collection, index, &records);
                    }
                    result.records = records;
                    result.source = Some(tier.name().to_string());
                    result.source_index = Some(index);
                    return result;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(collection = %collection, tier = tier.name(), error = %e, "tier read failed");
                    if tier.required() && result.error.is_none() {
                        result.error = Some(e);
                    }
                }
            }
        }

        result
    }

    /// Copy records found in a lower tier into every tier above it.
    fn heal(&self, collection: &str, found_at: usize, records: &[StoredRecord]) -> bool {
        let mut healed = true;
        for tier in &self.tiers[..found_at] {
            match tier.write(collection, records) {
                Ok(_) => info!(
                    collection = %collection,
                    tier = tier.name(),
                    records = records.len(),
                    "repaired tier from lower tier"
                ),
                Err(e) => {
                    healed = false;
                    warn!(collection = %collection, tier = tier.name(), error = %e, "tier repair failed");
                }
            }
        }
        healed
    }

    /// Write to every tier. Fails only if a required tier failed.
    pub fn write(&self, collection: &str, records: &[StoredRecord]) -> Result<FanOut> {
        self.fan_out(collection, |tier| tier.write(collection, records))
    }

    /// Clear every tier. Fails only if a required tier failed.
    pub fn clear(&self, collection: &str) -> Result<()> {
        self.fan_out(collection, |tier| tier.clear(collection).map(|()| false))?;
        Ok(())
    }

    fn fan_out<F>(&self, collection: &str, op: F) -> Result<FanOut>
    where
        F: Fn(&dyn StorageTier) -> Result<bool>,
    {
        let mut failure = None;
        let mut report = FanOut::default();

        for tier in &self.tiers {
            let status = match op(tier.as_ref()) {
                Ok(backed_up) => TierStatus::Written { backed_up },
                Err(e) => {
                    let status = TierStatus::Failed(e.to_string());
                    if tier.required() {
                        warn!(collection = %collection, tier = tier.name(), error = %e, "tier write failed");
                        failure.get_or_insert(e);
                    } else {
                        debug!(collection = %collection, tier = tier.name(), error = %e, "best-effort tier write failed");
                    }
                    status
                }
            };
            report.tiers.push((tier.name().to_string(), status));
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}
