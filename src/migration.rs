//! One-shot migration from legacy synchronous keys into the record store.
//!
//! A collection is migrated when its record-store copy is empty and the
//! legacy primary or backup slot holds a non-empty array. The copy replaces
//! the destination wholesale and leaves the legacy slots in place, so a
//! second run finds the destination populated and does nothing.

use crate::error::Result;
use crate::kv::KvStore;
use crate::records::{RecordStore, StoredRecord};
use crate::types::{identity_of, StorageKey, DEFAULT_IDENTITY_FIELD};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Records recovered from a legacy key.
#[derive(Clone, Debug, PartialEq)]
pub struct LegacyRead {
    pub records: Vec<StoredRecord>,
    /// True when the primary slot was unusable and the backup was read.
    pub from_backup: bool,
    /// Array entries dropped for lacking an identity.
    pub skipped: usize,
}

/// Read a legacy array from the primary slot, falling back to the backup.
///
/// Returns `None` unless one of the slots holds a parseable, non-empty
/// array with at least one identifiable record.
pub fn read_legacy(kv: &dyn KvStore, key: &StorageKey, identity_field: &str) -> Option<LegacyRead> {
    for (slot, from_backup) in [(key.clone(), false), (key.backup(), true)] {
        let raw = match kv.get(slot.as_str()) {
            Ok(Some(raw)) => raw,
            Ok(None) => continue,
            Err(e) => {
                warn!(key = %slot, error = %e, "legacy slot unreadable");
                continue;
            }
        };

        // Migration runs before every collection load, so a slot that simply
        // holds another shape stays at debug.
        let items = match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Array(items)) => items,
            Ok(_) => {
                debug!(key = %slot, "legacy slot does not hold an array");
                continue;
            }
            Err(e) => {
                warn!(key = %slot, error = %e, "legacy slot is not valid JSON");
                continue;
            }
        };

        let mut skipped = 0;
        let records: Vec<StoredRecord> = items
            .into_iter()
            .filter_map(|body| match identity_of(&body, identity_field) {
                Some(id) => Some(StoredRecord::new(id, body)),
                None => {
                    skipped += 1;
                    None
                }
            })
            .collect();

        if skipped > 0 {
            warn!(key = %slot, skipped, "legacy records without identity dropped");
        }
        if records.is_empty() {
            continue;
        }

        return Some(LegacyRead {
            records,
            from_backup,
            skipped,
        });
    }

    None
}

/// A legacy key and the collection it migrates into.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationEntry {
    pub legacy_key: StorageKey,
    pub collection: String,
    pub identity_field: String,
}

impl MigrationEntry {
    pub fn new(legacy_key: StorageKey, collection: impl Into<String>) -> Self {
        Self {
            legacy_key,
            collection: collection.into(),
            identity_field: DEFAULT_IDENTITY_FIELD.to_string(),
        }
    }

    pub fn with_identity_field(mut self, field: impl Into<String>) -> Self {
        self.identity_field = field.into();
        self
    }
}

/// What happened to one entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MigrationStatus {
    Migrated { records: usize, from_backup: bool },
    /// The destination already held records.
    DestinationPopulated,
    /// The legacy slots held nothing usable.
    NothingToMigrate,
    Failed(String),
}

/// Result of a migration run.
#[derive(Clone, Debug, Default)]
pub struct MigrationReport {
    pub entries: Vec<(MigrationEntry, MigrationStatus)>,
}

impl MigrationReport {
    /// Number of collections that received data.
    pub fn migrated(&self) -> usize {
        self.entries
            .iter()
            .filter(|(_, s)| matches!(s, MigrationStatus::Migrated { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.entries
            .iter()
            .filter(|(_, s)| matches!(s, MigrationStatus::Failed(_)))
            .count()
    }
}

/// Migrate one entry.
pub fn migrate_one(
    kv: &dyn KvStore,
    records: &dyn RecordStore,
    entry: &MigrationEntry,
) -> Result<MigrationStatus> {
    if records.count(&entry.collection)? > 0 {
        debug!(collection = %entry.collection, "destination populated, skipping migration");
        return Ok(MigrationStatus::DestinationPopulated);
    }

    let Some(legacy) = read_legacy(kv, &entry.legacy_key, &entry.identity_field) else {
        return Ok(MigrationStatus::NothingToMigrate);
    };

    let count = legacy.records.len();
    records.replace_all(&entry.collection, legacy.records)?;

    info!(
        legacy_key = %entry.legacy_key,
        collection = %entry.collection,
        records = count,
        from_backup = legacy.from_backup,
        "migrated legacy data into record store"
    );

    Ok(MigrationStatus::Migrated {
        records: count,
        from_backup: legacy.from_backup,
    })
}

/// Runs migration over a fixed set of entries.
pub struct Migrator {
    kv: Arc<dyn KvStore>,
    records: Arc<dyn RecordStore>,
    entries: Vec<MigrationEntry>,
}

impl Migrator {
    pub fn new(kv: Arc<dyn KvStore>, records: Arc<dyn RecordStore>) -> Self {
        Self {
            kv,
            records,
            entries: Vec::new(),
        }
    }

    pub fn with_entry(mut self, entry: MigrationEntry) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn entries(&self) -> &[MigrationEntry] {
        &self.entries
    }

    /// Migrate every entry. Failures are reported, never raised.
    pub fn run(&self) -> MigrationReport {
        let mut report = MigrationReport::default();

        for entry in &self.entries {
            let status = match migrate_one(self.kv.as_ref(), self.records.as_ref(), entry) {
                Ok(status) => status,
                Err(e) => {
                    warn!(collection = %entry.collection, error = %e, "migration failed");
                    MigrationStatus::Failed(e.to_string())
                }
            };
            report.entries.push((entry.clone(), status));
        }

        report
    }
}
