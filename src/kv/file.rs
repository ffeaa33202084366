//! File-backed synchronous store.
//!
//! The whole map lives in memory. Primary slots and `_backup` slots are
//! persisted to two separate checksummed files, and each mutation rewrites
//! only the file its key belongs to, so a crash leaves either the old or
//! the new file. A damaged file is moved aside on open and its slots start
//! empty; the other file still loads, which keeps backups reachable when
//! the primary file is lost.

use super::{KvMap, KvStore};
use crate::error::{CacheError, Result};
use crate::frame::{acquire_lock, read_framed, write_framed};
use crate::types::BACKUP_SUFFIX;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Magic bytes for the key-value files.
const KV_MAGIC: &[u8; 4] = b"SKV\0";

/// Current key-value file format version.
const KV_VERSION: u8 = 1;

/// Data file holding primary slots.
const KV_FILE: &str = "primary.kv";

/// Data file holding backup slots.
const BACKUP_FILE: &str = "backup.kv";

fn is_backup_key(key: &str) -> bool {
    key.ends_with(BACKUP_SUFFIX)
}

/// Failures that mean the file content is damaged rather than unreachable.
fn is_damage(e: &CacheError) -> bool {
    match e {
        CacheError::ChecksumMismatch { .. }
        | CacheError::Corruption(_)
        | CacheError::InvalidFormat(_) => true,
        CacheError::Io(io) => io.kind() == ErrorKind::UnexpectedEof,
        _ => false,
    }
}

/// Load one slot file. A damaged file is renamed to `<name>.corrupt` and
/// read as empty.
fn load_slots(path: &Path) -> Result<BTreeMap<String, String>> {
    let decoded = read_framed(path, KV_MAGIC, KV_VERSION).and_then(|payload| match payload {
        Some(payload) => serde_json::from_slice(&payload)
            .map_err(|e| CacheError::Corruption(format!("{}: {}", path.display(), e))),
        None => Ok(BTreeMap::new()),
    });

    match decoded {
        Ok(entries) => Ok(entries),
        Err(e) if is_damage(&e) => {
            let quarantine = path.with_extension("kv.corrupt");
            error!(
                path = %path.display(),
                quarantine = %quarantine.display(),
                error = %e,
                "slot file damaged, continuing without it"
            );
            if let Err(rename) = fs::rename(path, &quarantine) {
                warn!(path = %path.display(), error = %rename, "could not move damaged slot file aside");
            }
            Ok(BTreeMap::new())
        }
        Err(e) => Err(e),
    }
}

/// Durable key-value store with a byte quota.
pub struct FileKvStore {
    /// Primary slot file.
    path: PathBuf,

    /// Backup slot file.
    backup_path: PathBuf,

    /// Lock file for exclusive access.
    _lock_file: File,

    map: RwLock<KvMap>,
}

impl FileKvStore {
    /// Open the store in `dir`, creating it if missing.
    pub fn open(dir: impl AsRef<Path>, capacity: usize) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let lock_file = acquire_lock(dir)?;
        let path = dir.join(KV_FILE);
        let backup_path = dir.join(BACKUP_FILE);

        let primaries = load_slots(&path)?;
        let backups = load_slots(&backup_path)?;
        let misplaced =
            primaries.keys().any(|k| is_backup_key(k)) || backups.keys().any(|k| !is_backup_key(k));

        let mut entries = primaries;
        entries.extend(backups);

        debug!(path = %path.display(), keys = entries.len(), "opened key-value store");

        let store = Self {
            path,
            backup_path,
            _lock_file: lock_file,
            map: RwLock::new(KvMap::from_entries(entries, capacity)),
        };

        if misplaced {
            let map = store.map.read();
            store.persist(&map, false)?;
            store.persist(&map, true)?;
            info!(path = %store.path.display(), "moved slots into their own files");
        }

        Ok(store)
    }

    /// Primary slot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Backup slot file.
    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    fn persist(&self, map: &KvMap, backup: bool) -> Result<()> {
        let slots: BTreeMap<&str, &str> = map
            .entries()
            .iter()
            .filter(|(k, _)| is_backup_key(k) == backup)
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let payload = serde_json::to_vec(&slots)?;

        let path = if backup { &self.backup_path } else { &self.path };
        write_framed(path, KV_MAGIC, KV_VERSION, &payload)
    }
}

impl KvStore for FileKvStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut map = self.map.write();
        let previous = map.insert(key, value)?;

        if let Err(e) = self.persist(&map, is_backup_key(key)) {
            map.restore(key, previous);
            return Err(e);
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        let mut map = self.map.write();
        let Some(previous) = map.remove(key) else {
            return Ok(false);
        };

        if let Err(e) = self.persist(&map, is_backup_key(key)) {
            map.restore(key, Some(previous));
            return Err(e);
        }
        Ok(true)
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.map.read().keys())
    }

    fn used_bytes(&self) -> usize {
        self.map.read().used()
    }

    fn capacity_bytes(&self) -> usize {
        self.map.read().capacity()
    }
}
