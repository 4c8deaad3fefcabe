//! Metadata and eviction collaborator
//!
//! The coordinator does not own the cache-size budget; it delegates usage
//! tracking, space reservation, and eviction to a [`CleanupManager`]. A
//! database-backed implementation lives with the host; the in-memory
//! [`MemoryCleanupManager`] here tracks per-key rows and evicts
//! least-recently-used files, which is enough for single-process hosts
//! and for exercising the coordinator end to end.

use crate::entry::CacheEntry;
use crate::error::Result;
use crate::keyed_lock::KeyedLockRegistry;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of a space reservation.
#[derive(Debug, Clone)]
pub struct SpaceReservation {
    pub success: bool,
    pub message: Option<String>,
}

impl SpaceReservation {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

/// External metadata + eviction collaborator. Implementations must be
/// thread-safe; every method may be called concurrently for distinct keys.
#[async_trait]
pub trait CleanupManager: Send + Sync {
    /// Record that the entry was requested (LRU touch).
    async fn notify_used(&self, entry: &CacheEntry);

    /// Look up the stored content type for an entry, if known.
    async fn get_content_type(
        &self,
        entry: &CacheEntry,
        cancel: &CancellationToken,
    ) -> Result<Option<String>>;

    /// Ensure `bytes` can be written under the cache-size limit, evicting
    /// when allowed. Evictions must hold the per-key lock from the passed
    /// registry so a file being read or written under the same key is never
    /// deleted out from under its user.
    async fn try_reserve_space(
        &self,
        entry: &CacheEntry,
        content_type: Option<&str>,
        bytes: u64,
        allow_eviction: bool,
        evict_locks: &Arc<KeyedLockRegistry>,
        cancel: &CancellationToken,
    ) -> Result<SpaceReservation>;

    /// Persist the metadata row for a written file.
    async fn mark_file_created(
        &self,
        entry: &CacheEntry,
        content_type: Option<&str>,
        bytes: u64,
        created_at: SystemTime,
    );
}

/// Metadata row tracked per cached file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub string_key: String,
    pub physical_path: PathBuf,
    pub relative_path: String,
    pub size_bytes: u64,
    pub content_type: Option<String>,
    /// Last access, milliseconds since the Unix epoch.
    pub last_used_ms: u64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// In-memory LRU cleanup manager.
///
/// Rows live in a DashMap keyed by `string_key`; eviction scans for the
/// least recently used row, takes its evict lock, deletes the file, and
/// drops the row. `max_cache_bytes == 0` means unlimited.
pub struct MemoryCleanupManager {
    max_cache_bytes: u64,
    evict_lock_timeout: Duration,
    records: DashMap<String, FileRecord>,
    total_bytes: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryCleanupManager {
    pub fn new(max_cache_bytes: u64) -> Self {
        Self {
            max_cache_bytes,
            evict_lock_timeout: Duration::from_secs(1),
            records: DashMap::new(),
            total_bytes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Unlimited budget: reservations always succeed without eviction.
    pub fn unbounded() -> Self {
        Self::new(0)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn eviction_count(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Least-recently-used row, excluding the key currently being written
    /// and any candidates already found busy this pass.
    fn lru_victim(&self, exclude_key: &str, skip: &[String]) -> Option<FileRecord> {
        self.records
            .iter()
            .filter(|row| row.string_key != exclude_key && !skip.contains(&row.string_key))
            .min_by_key(|row| row.last_used_ms)
            .map(|row| row.value().clone())
    }

    async fn evict_one(
        &self,
        exclude_key: &str,
        skip: &mut Vec<String>,
        evict_locks: &Arc<KeyedLockRegistry>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let Some(victim) = self.lru_victim(exclude_key, skip) else {
            return Ok(false);
        };

        let Some(_guard) = evict_locks
            .acquire(&victim.string_key, self.evict_lock_timeout, cancel)
            .await?
        else {
            // Someone is reading or writing this key right now; try the
            // next-oldest candidate instead.
            debug!(key = %victim.relative_path, "Eviction candidate busy, skipping");
            skip.push(victim.string_key);
            return Ok(true);
        };

        match tokio::fs::remove_file(&victim.physical_path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(key = %victim.relative_path, error = %err, "Failed to delete evicted file");
                return Err(err.into());
            }
        }

        if self.records.remove(&victim.string_key).is_some() {
            self.total_bytes
                .fetch_sub(victim.size_bytes, Ordering::Relaxed);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            info!(
                key = %victim.relative_path,
                size = victim.size_bytes,
                "Evicted cache file"
            );
        }
        Ok(true)
    }
}

#[async_trait]
impl CleanupManager for MemoryCleanupManager {
    async fn notify_used(&self, entry: &CacheEntry) {
        if let Some(mut row) = self.records.get_mut(&entry.string_key) {
            row.last_used_ms = now_ms();
        }
    }

    async fn get_content_type(
        &self,
        entry: &CacheEntry,
        _cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        Ok(self
            .records
            .get(&entry.string_key)
            .and_then(|row| row.content_type.clone()))
    }

    async fn try_reserve_space(
        &self,
        entry: &CacheEntry,
        _content_type: Option<&str>,
        bytes: u64,
        allow_eviction: bool,
        evict_locks: &Arc<KeyedLockRegistry>,
        cancel: &CancellationToken,
    ) -> Result<SpaceReservation> {
        if self.max_cache_bytes == 0 {
            return Ok(SpaceReservation::ok());
        }
        if bytes > self.max_cache_bytes {
            return Ok(SpaceReservation::failed(format!(
                "artifact of {} bytes exceeds cache limit of {} bytes",
                bytes, self.max_cache_bytes
            )));
        }

        let mut busy = Vec::new();
        while self.total_bytes.load(Ordering::Relaxed) + bytes > self.max_cache_bytes {
            if !allow_eviction {
                return Ok(SpaceReservation::failed(
                    "cache full and eviction not allowed on this path",
                ));
            }
            if !self
                .evict_one(&entry.string_key, &mut busy, evict_locks, cancel)
                .await?
            {
                return Ok(SpaceReservation::failed(
                    "cache full and no evictable entries",
                ));
            }
        }

        Ok(SpaceReservation::ok())
    }

    async fn mark_file_created(
        &self,
        entry: &CacheEntry,
        content_type: Option<&str>,
        bytes: u64,
        created_at: SystemTime,
    ) {
        let last_used_ms = created_at
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let row = FileRecord {
            string_key: entry.string_key.clone(),
            physical_path: entry.physical_path.clone(),
            relative_path: entry.relative_path.clone(),
            size_bytes: bytes,
            content_type: content_type.map(|ct| ct.to_string()),
            last_used_ms,
        };

        // Upsert: try_write over-reports on lost races, so replace rather
        // than double-count.
        match self.records.insert(entry.string_key.clone(), row) {
            Some(old) => {
                self.total_bytes.fetch_sub(old.size_bytes, Ordering::Relaxed);
                self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
            }
            None => {
                self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry_in(dir: &std::path::Path, key: &str) -> CacheEntry {
        CacheEntry {
            string_key: key.to_string(),
            physical_path: dir.join(key),
            relative_path: key.to_string(),
        }
    }

    #[tokio::test]
    async fn test_mark_created_then_content_type() {
        let tmp = TempDir::new().unwrap();
        let mgr = MemoryCleanupManager::unbounded();
        let entry = entry_in(tmp.path(), "a");
        let cancel = CancellationToken::new();

        mgr.mark_file_created(&entry, Some("image/png"), 10, SystemTime::now())
            .await;

        assert_eq!(mgr.total_bytes(), 10);
        assert_eq!(
            mgr.get_content_type(&entry, &cancel).await.unwrap(),
            Some("image/png".to_string())
        );
    }

    #[tokio::test]
    async fn test_upsert_does_not_double_count() {
        let tmp = TempDir::new().unwrap();
        let mgr = MemoryCleanupManager::unbounded();
        let entry = entry_in(tmp.path(), "a");

        mgr.mark_file_created(&entry, None, 10, SystemTime::now()).await;
        mgr.mark_file_created(&entry, None, 12, SystemTime::now()).await;

        assert_eq!(mgr.total_bytes(), 12);
        assert_eq!(mgr.record_count(), 1);
    }

    #[tokio::test]
    async fn test_reserve_without_eviction_fails_when_full() {
        let tmp = TempDir::new().unwrap();
        let mgr = MemoryCleanupManager::new(100);
        let locks = KeyedLockRegistry::new();
        let cancel = CancellationToken::new();

        mgr.mark_file_created(&entry_in(tmp.path(), "a"), None, 80, SystemTime::now())
            .await;

        let reservation = mgr
            .try_reserve_space(&entry_in(tmp.path(), "b"), None, 40, false, &locks, &cancel)
            .await
            .unwrap();
        assert!(!reservation.success);
        assert_eq!(mgr.record_count(), 1);
    }

    #[tokio::test]
    async fn test_reserve_evicts_lru_file() {
        let tmp = TempDir::new().unwrap();
        let mgr = MemoryCleanupManager::new(100);
        let locks = KeyedLockRegistry::new();
        let cancel = CancellationToken::new();

        let old = entry_in(tmp.path(), "old");
        let new = entry_in(tmp.path(), "new");
        tokio::fs::write(&old.physical_path, vec![0u8; 80]).await.unwrap();

        mgr.mark_file_created(&old, None, 80, SystemTime::UNIX_EPOCH).await;

        let reservation = mgr
            .try_reserve_space(&new, None, 40, true, &locks, &cancel)
            .await
            .unwrap();

        assert!(reservation.success);
        assert_eq!(mgr.eviction_count(), 1);
        assert_eq!(mgr.total_bytes(), 0);
        assert!(tokio::fs::metadata(&old.physical_path).await.is_err());
    }

    #[tokio::test]
    async fn test_eviction_skips_key_under_evict_lock() {
        let tmp = TempDir::new().unwrap();
        let mgr = MemoryCleanupManager::new(100);
        let locks = KeyedLockRegistry::new();
        let cancel = CancellationToken::new();

        let busy = entry_in(tmp.path(), "busy");
        tokio::fs::write(&busy.physical_path, vec![0u8; 80]).await.unwrap();
        mgr.mark_file_created(&busy, None, 80, SystemTime::UNIX_EPOCH).await;

        let _reading = locks
            .acquire(&busy.string_key, Duration::from_secs(1), &cancel)
            .await
            .unwrap()
            .unwrap();

        let reservation = mgr
            .try_reserve_space(&entry_in(tmp.path(), "b"), None, 40, true, &locks, &cancel)
            .await
            .unwrap();

        assert!(!reservation.success);
        assert!(tokio::fs::metadata(&busy.physical_path).await.is_ok());
    }

    #[tokio::test]
    async fn test_oversized_artifact_refused() {
        let tmp = TempDir::new().unwrap();
        let mgr = MemoryCleanupManager::new(100);
        let locks = KeyedLockRegistry::new();
        let cancel = CancellationToken::new();

        let reservation = mgr
            .try_reserve_space(&entry_in(tmp.path(), "a"), None, 500, true, &locks, &cancel)
            .await
            .unwrap();
        assert!(!reservation.success);
    }
}
