//! Key/blob cache for precomputed tables and trial results
//!
//! Loss tables and finished trial tables are expensive to recompute, so
//! both are persisted to a cache directory keyed by a deterministic
//! parameter string (dataset identity, grid shape, alphas, delta, trial
//! counts, strategy name). Keys are hashed to SHA-256 hex so arbitrary
//! parameter strings map to safe filenames; blobs are MessagePack.
//!
//! Miss policy: an absent key means recompute and write. A blob that
//! fails to decode is treated as a miss with a warning rather than an
//! abort; partial writes are assumed not to happen (atomic persistence is
//! the collaborator's contract).

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors raised by cache operations
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode blob: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("failed to decode blob: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Directory-backed key→blob store.
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    /// Open (creating if needed) a cache rooted at `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Deterministic key from ordered parameter parts.
    pub fn key(parts: &[&str]) -> String {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_bytes());
            hasher.update([0x1f]); // unit separator so parts cannot collide
        }
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.mpk"))
    }

    /// Load a blob, returning None on an absent key.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let path = self.path_for(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let value = rmp_serde::from_slice(&bytes)?;
        Ok(Some(value))
    }

    /// Persist a blob under a key, replacing any previous value.
    pub fn store<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = rmp_serde::to_vec(value)?;
        fs::write(self.path_for(key), bytes)?;
        Ok(())
    }

    /// Load the cached value, or compute, persist, and return it.
    ///
    /// A decode failure is downgraded to a recompute with a warning; the
    /// fresh value overwrites the unreadable blob.
    pub fn load_or_compute<T, F>(&self, key: &str, compute: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> T,
    {
        match self.load(key) {
            Ok(Some(value)) => {
                tracing::debug!(key, "cache hit");
                return Ok(value);
            }
            Ok(None) => {}
            Err(CacheError::Decode(err)) => {
                tracing::warn!(key, %err, "unreadable cache blob; recomputing");
            }
            Err(err) => return Err(err),
        }
        let value = compute();
        self.store(key, &value)?;
        Ok(value)
    }
}
