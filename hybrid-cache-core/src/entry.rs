//! Cache entry derivation
//!
//! Maps an opaque fingerprint key to its textual key and on-disk location.
//! The derivation is injected via [`PathBuilder`]; the shipped
//! [`HashedPathBuilder`] stores files by SHA-256 hash in a two-level
//! directory structure to avoid filesystem limitations with large numbers
//! of files in a single directory.

use sha2::{Digest, Sha256};
use std::path::PathBuf;

/// Derived identity and location of one cacheable artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheEntry {
    /// Stable textual rendering of the fingerprint, used for lock naming
    /// and queue indexing. Canonical lowercase.
    pub string_key: String,
    /// Absolute path where the artifact lives when cached.
    pub physical_path: PathBuf,
    /// Display form for logs.
    pub relative_path: String,
}

/// Injected key-to-path derivation. Must be deterministic; `string_key`
/// uniqueness is equivalent to `physical_path` uniqueness.
pub trait PathBuilder: Send + Sync {
    fn derive(&self, key: &[u8]) -> CacheEntry;
}

/// Content-addressed path builder: SHA-256 of the fingerprint, hex encoded,
/// fanned out as `{root}/ab/cd/abcdef...`.
#[derive(Debug, Clone)]
pub struct HashedPathBuilder {
    root: PathBuf,
}

impl HashedPathBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Compute the lowercase hex SHA-256 of a fingerprint key.
    pub fn compute_hash(key: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key);
        hex::encode(hasher.finalize())
    }
}

impl PathBuilder for HashedPathBuilder {
    fn derive(&self, key: &[u8]) -> CacheEntry {
        let hash = Self::compute_hash(key);
        let relative_path = format!("{}/{}/{}", &hash[0..2], &hash[2..4], hash);
        let physical_path = self
            .root
            .join(&hash[0..2])
            .join(&hash[2..4])
            .join(&hash);

        CacheEntry {
            string_key: hash,
            physical_path,
            relative_path,
        }
    }
}
