//! Configuration for the cache coordinator

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the hybrid cache coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridCacheConfig {
    /// Upper bound on memory held by unflushed write buffers.
    /// `<= 0` disables async queuing entirely (every enqueue reports full).
    pub max_queued_bytes: i64,

    /// Timeout for the request-dedup lock and the evict-and-write lock.
    pub wait_for_identical_requests_ms: u64,

    /// Timeout for the file-write lock and the contended-read retry loop.
    pub wait_for_identical_disk_writes_ms: u64,

    /// When the queue is full, flush inline instead of returning an uncached miss.
    pub write_synchronously_when_queue_full: bool,

    /// When the dedup lock times out, fail the request instead of producing uncached bytes.
    pub fail_on_enqueue_lock_timeout: bool,

    /// Write through a sibling temp file plus atomic rename. Disabling writes
    /// the destination path directly.
    pub move_files_into_place: bool,
}

impl Default for HybridCacheConfig {
    fn default() -> Self {
        Self {
            max_queued_bytes: 100 * 1024 * 1024, // 100 MB
            wait_for_identical_requests_ms: 100_000,
            wait_for_identical_disk_writes_ms: 15_000,
            write_synchronously_when_queue_full: true,
            fail_on_enqueue_lock_timeout: false,
            move_files_into_place: true,
        }
    }
}

impl HybridCacheConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("CACHE_MAX_QUEUED_MB") {
            if let Ok(mb) = val.parse::<i64>() {
                config.max_queued_bytes = mb * 1024 * 1024;
            }
        }

        if let Ok(val) = std::env::var("CACHE_WAIT_IDENTICAL_REQUESTS_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                config.wait_for_identical_requests_ms = ms;
            }
        }

        if let Ok(val) = std::env::var("CACHE_WAIT_IDENTICAL_DISK_WRITES_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                config.wait_for_identical_disk_writes_ms = ms;
            }
        }

        if let Ok(val) = std::env::var("CACHE_WRITE_SYNC_WHEN_FULL") {
            if let Ok(flag) = val.parse::<bool>() {
                config.write_synchronously_when_queue_full = flag;
            }
        }

        config
    }

    pub fn wait_for_identical_requests(&self) -> Duration {
        Duration::from_millis(self.wait_for_identical_requests_ms)
    }

    pub fn wait_for_identical_disk_writes(&self) -> Duration {
        Duration::from_millis(self.wait_for_identical_disk_writes_ms)
    }
}
