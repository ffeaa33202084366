//! Checksummed file framing shared by the file-backed stores.
//!
//! Layout: magic (4 bytes), version (1 byte), payload length (u64 LE),
//! payload, CRC32 of the payload (u32 LE). Files are replaced atomically by
//! writing a sibling temp file and renaming it over the target.

use crate::error::{CacheError, Result};
use fs2::FileExt;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

/// Write `payload` to `path` atomically.
pub(crate) fn write_framed(path: &Path, magic: &[u8; 4], version: u8, payload: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");

    {
        let mut file = File::create(&tmp_path)?;

        file.write_all(magic)?;
        file.write_all(&[version])?;

        let len = payload.len() as u64;
        file.write_all(&len.to_le_bytes())?;
        file.write_all(payload)?;

        let checksum = crc32fast::hash(payload);
        file.write_all(&checksum.to_le_bytes())?;

        file.sync_all()?;
    }

    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Read and verify a framed file. Returns `None` if the file does not exist.
pub(crate) fn read_framed(path: &Path, magic: &[u8; 4], version: u8) -> Result<Option<Vec<u8>>> {
    if !path.exists() {
        return Ok(None);
    }

    let mut file = File::open(path)?;

    let mut found_magic = [0u8; 4];
    file.read_exact(&mut found_magic)?;
    if &found_magic != magic {
        return Err(CacheError::InvalidFormat(format!(
            "Invalid magic in {}",
            path.display()
        )));
    }

    let mut found_version = [0u8; 1];
    file.read_exact(&mut found_version)?;
    if found_version[0] != version {
        return Err(CacheError::InvalidFormat(format!(
            "Unsupported version {} in {}",
            found_version[0],
            path.display()
        )));
    }

    let mut len_bytes = [0u8; 8];
    file.read_exact(&mut len_bytes)?;
    let len = u64::from_le_bytes(len_bytes) as usize;

    let mut payload = vec![0u8; len];
    file.read_exact(&mut payload).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            CacheError::Corruption(format!("Truncated payload in {}", path.display()))
        } else {
            CacheError::Io(e)
        }
    })?;

    let mut checksum_bytes = [0u8; 4];
    file.read_exact(&mut checksum_bytes)?;
    let stored = u32::from_le_bytes(checksum_bytes);
    let computed = crc32fast::hash(&payload);

    if stored != computed {
        return Err(CacheError::ChecksumMismatch {
            expected: stored,
            got: computed,
        });
    }

    Ok(Some(payload))
}

/// Take an exclusive lock on `dir/LOCK` for the lifetime of the returned file.
pub(crate) fn acquire_lock(dir: &Path) -> Result<File> {
    let lock_file = File::create(dir.join("LOCK"))?;

    lock_file
        .try_lock_exclusive()
        .map_err(|_| CacheError::Locked)?;

    Ok(lock_file)
}
