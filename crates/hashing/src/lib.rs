//! Content fingerprints for transferred artifacts.
//!
//! A [`Hash`] is the SHA-256 digest of a file's full byte content and is
//! used for both identity (cache keys, dedup) and integrity verification
//! after a transfer. Helpers cover one-shot hashing, async streaming
//! hashing of files, and incremental hashing for streams that want to
//! fingerprint while writing.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

/// Read buffer size for streaming file hashing.
const READ_BUF_SIZE: usize = 64 * 1024;

/// Errors from hashing operations.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cancelled")]
    Cancelled,
}

/// SHA-256 content fingerprint.
///
/// Displays and serializes as 64 lowercase hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; 32]);

impl Hash {
    /// Wraps a raw 32-byte digest.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns the lowercase hex representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Error returned when parsing a hex string into a [`Hash`].
#[derive(Debug, thiserror::Error)]
#[error("invalid hash: expected 64 hex characters")]
pub struct ParseHashError;

impl FromStr for Hash {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| ParseHashError)?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| ParseHashError)?;
        Ok(Self(arr))
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Computes the SHA-256 fingerprint of an in-memory buffer.
pub fn hash_bytes(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Hash(hasher.finalize().into())
}

/// Computes the SHA-256 fingerprint of an entire file by streaming it
/// in 64 KiB reads.
///
/// Checks `token` between reads and fails with [`HashError::Cancelled`]
/// if it fires mid-file.
pub async fn hash_file(path: &Path, token: &CancellationToken) -> Result<Hash, HashError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Hasher::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        if token.is_cancelled() {
            return Err(HashError::Cancelled);
        }
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// Incremental SHA-256 hasher for fingerprinting a stream while writing it.
///
/// Lets download paths produce the final [`Hash`] without a second read
/// pass over the destination file.
pub struct Hasher {
    inner: Sha256,
    bytes_hashed: u64,
}

impl Hasher {
    /// Creates an empty hasher.
    pub fn new() -> Self {
        Self {
            inner: Sha256::new(),
            bytes_hashed: 0,
        }
    }

    /// Feeds `data` into the digest.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.bytes_hashed += data.len() as u64;
    }

    /// Total bytes fed so far.
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes_hashed
    }

    /// Consumes the hasher and returns the fingerprint.
    pub fn finalize(self) -> Hash {
        Hash(self.inner.finalize().into())
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}
