//! Persistent content-hash memoization keyed by absolute path.
//!
//! Hashing multi-gigabyte artifacts is expensive, so fingerprints are
//! cached in a durable keyed store and validated by the file's current
//! (size, mtime) pair. A stale entry is recomputed lazily on the next
//! lookup; entries are never proactively expired.
//!
//! Concurrent lookups for the same path are deliberately not serialized:
//! both may hash the file, and the last store write wins. That is an
//! accepted property, not a bug: the digest is deterministic, so both
//! writers store the same value for unchanged content.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use modferry_hashing::{Hash, HashError, hash_file};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Errors from cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("file not found: {0}")]
    NotFound(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cancelled")]
    Cancelled,

    #[error("store error: {0}")]
    Store(#[from] sled::Error),

    #[error("entry encoding error: {0}")]
    Codec(#[from] postcard::Error),
}

/// One cached fingerprint, valid while the on-disk (size, mtime) pair
/// still matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct CacheEntry {
    hash: Hash,
    size: u64,
    mtime_ns: u64,
}

/// Durable path → fingerprint cache.
///
/// Cheap to share behind an `Arc`; sled handles cross-thread access with
/// independent per-key entries.
pub struct HashCache {
    db: sled::Db,
}

impl HashCache {
    /// Opens (or creates) the cache database at `db_path`.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let db = sled::open(db_path)?;
        Ok(Self { db })
    }

    /// Returns the content fingerprint of `path`, hashing the file only
    /// if no stored entry matches its current (size, mtime).
    ///
    /// Fails with [`CacheError::NotFound`] if the file does not exist at
    /// stat time, and [`CacheError::Cancelled`] if `token` fires during
    /// a recompute.
    pub async fn get_or_compute(
        &self,
        path: &Path,
        token: &CancellationToken,
    ) -> Result<Hash, CacheError> {
        let (size, mtime_ns) = stat(path).await?;
        let key = entry_key(path)?;

        if let Some(entry) = self.load(&key)? {
            if entry.size == size && entry.mtime_ns == mtime_ns {
                trace!(path = %path.display(), hash = %entry.hash, "hash cache hit");
                return Ok(entry.hash);
            }
            debug!(path = %path.display(), "hash cache entry stale, rehashing");
        }

        let hash = hash_file(path, token).await.map_err(|e| match e {
            HashError::Cancelled => CacheError::Cancelled,
            HashError::Io(io) => CacheError::Io(io),
        })?;

        // Re-stat so the stored validity pair reflects the file we read;
        // if it changed mid-hash the entry goes stale immediately, which
        // is the safe direction.
        let (size, mtime_ns) = stat(path).await?;
        self.store(
            &key,
            CacheEntry {
                hash,
                size,
                mtime_ns,
            },
        )?;
        debug!(path = %path.display(), %hash, size, "hash computed and cached");
        Ok(hash)
    }

    /// Force-sets the fingerprint for `path` using its current
    /// (size, mtime).
    ///
    /// Used right after a transfer that already knows the resulting
    /// hash, avoiding a redundant full read of the file.
    pub fn write(&self, path: &Path, hash: Hash) -> Result<(), CacheError> {
        let meta = std::fs::metadata(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CacheError::NotFound(path.to_path_buf()),
            _ => CacheError::Io(e),
        })?;
        let key = entry_key(path)?;
        self.store(
            &key,
            CacheEntry {
                hash,
                size: meta.len(),
                mtime_ns: mtime_nanos(&meta)?,
            },
        )?;
        trace!(path = %path.display(), %hash, "hash write-through");
        Ok(())
    }

    /// Returns the cached fingerprint if the file exists and its stored
    /// entry is still valid. Never hashes.
    pub async fn try_get(&self, path: &Path) -> Result<Option<Hash>, CacheError> {
        let (size, mtime_ns) = match stat(path).await {
            Ok(pair) => pair,
            Err(CacheError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let key = entry_key(path)?;
        Ok(self
            .load(&key)?
            .filter(|e| e.size == size && e.mtime_ns == mtime_ns)
            .map(|e| e.hash))
    }

    /// Removes the entry for `path`, if any.
    pub fn invalidate(&self, path: &Path) -> Result<(), CacheError> {
        let key = entry_key(path)?;
        self.db.remove(key)?;
        Ok(())
    }

    /// Flushes pending writes to disk.
    pub async fn flush(&self) -> Result<(), CacheError> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn load(&self, key: &[u8]) -> Result<Option<CacheEntry>, CacheError> {
        match self.db.get(key)? {
            Some(raw) => Ok(Some(postcard::from_bytes(&raw)?)),
            None => Ok(None),
        }
    }

    fn store(&self, key: &[u8], entry: CacheEntry) -> Result<(), CacheError> {
        let raw = postcard::to_allocvec(&entry)?;
        self.db.insert(key, raw)?;
        Ok(())
    }
}

/// Store key for a path: its absolute form, lossily UTF-8 encoded.
fn entry_key(path: &Path) -> Result<Vec<u8>, CacheError> {
    let abs = std::path::absolute(path)?;
    Ok(abs.to_string_lossy().into_owned().into_bytes())
}

async fn stat(path: &Path) -> Result<(u64, u64), CacheError> {
    let meta = tokio::fs::metadata(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => CacheError::NotFound(path.to_path_buf()),
        _ => CacheError::Io(e),
    })?;
    Ok((meta.len(), mtime_nanos(&meta)?))
}

fn mtime_nanos(meta: &std::fs::Metadata) -> Result<u64, CacheError> {
    let mtime = meta.modified()?;
    let nanos = mtime
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    Ok(nanos as u64)
}
