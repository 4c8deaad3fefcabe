//! Cache coordinator
//!
//! The public entry point composing the dedup lock, the in-memory write
//! queue, the disk write path, and the space-reservation gate. A request
//! resolves from disk, from a pending write buffer, or by invoking the
//! caller's producer and persisting the result, with concurrent identical
//! requests collapsed to a single producer run.
//!
//! ## Request flow
//!
//! ```text
//!  get_or_create(key)
//!    │ notify_used ──► CleanupManager (LRU touch)
//!    │ fast disk probe ───────────────► DiskHit
//!    │ dedup lock (string_key)
//!    │   ├─ write queue re-check ─────► MemoryHit
//!    │   ├─ disk re-check + wait ─────► DiskHit / ContendedDiskHit
//!    │   ├─ producer(cancel) ─► WriteBuffer ─► caller's reader
//!    │   └─ enqueue ── full? ─► synchronous flush (may evict)
//!    │                └─ else ─► background flush task
//!    └─ flush: reserve space ─► temp write + rename ─► mark_file_created
//! ```

use crate::cleanup::CleanupManager;
use crate::config::HybridCacheConfig;
use crate::disk::{self, OpenAttempt};
use crate::entry::{CacheEntry, PathBuilder};
use crate::error::{CacheError, Result};
use crate::file_writer::{FileWriter, MoveFileOverwriteFn, WriteOutcome};
use crate::keyed_lock::KeyedLockRegistry;
use crate::write_buffer::{CacheReader, WriteBuffer};
use crate::write_queue::{EnqueueOutcome, WriteQueue};
use bytes::Bytes;
use serde::Serialize;
use std::future::Future;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::fs::File;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ============================================================================
// Result types
// ============================================================================

/// Which internal path produced a cache result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDetail {
    Unknown,
    /// Served from a pending write buffer.
    MemoryHit,
    /// The cache file existed and opened on the first try.
    DiskHit,
    /// The cache file was held by a writer; the retry loop won.
    ContendedDiskHit,
    /// Produced, flushed synchronously, and now on disk.
    WriteSucceeded,
    /// Dedup lock timed out; produced uncached bytes for this caller.
    QueueLockTimeoutAndCreated,
    /// A concurrent writer persisted the same artifact first.
    FileAlreadyExists,
    /// Produced and handed to the caller; not (yet) persisted.
    Miss,
    /// Space could not be reserved; the artifact will not persist.
    CacheEvictionFailed,
    /// The file-write lock timed out during flush.
    WriteTimedOut,
    /// Dedup lock timed out and the request was configured to fail.
    QueueLockTimeoutAndFailed,
    /// The evict-and-write lock timed out during flush.
    EvictAndWriteLockTimedOut,
}

/// What the caller gets back: the classification, a readable stream (absent
/// only for failed requests), and the content type when known.
#[derive(Debug)]
pub struct CacheResult {
    pub detail: CacheDetail,
    pub reader: Option<CacheReader>,
    pub content_type: Option<String>,
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Default)]
struct CacheStats {
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    contended_disk_hits: AtomicU64,
    misses: AtomicU64,
    queue_full_rejections: AtomicU64,
    queue_lock_timeouts: AtomicU64,
    writes_succeeded: AtomicU64,
    flush_failures: AtomicU64,
}

/// Point-in-time view of coordinator counters.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub contended_disk_hits: u64,
    pub misses: u64,
    pub queue_full_rejections: u64,
    pub queue_lock_timeouts: u64,
    pub writes_succeeded: u64,
    pub flush_failures: u64,
}

impl StatsSnapshot {
    /// Fraction of requests answered without running the producer.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.memory_hits + self.disk_hits + self.contended_disk_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

impl CacheStats {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            disk_hits: self.disk_hits.load(Ordering::Relaxed),
            contended_disk_hits: self.contended_disk_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            queue_full_rejections: self.queue_full_rejections.load(Ordering::Relaxed),
            queue_lock_timeouts: self.queue_lock_timeouts.load(Ordering::Relaxed),
            writes_succeeded: self.writes_succeeded.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Flush task
// ============================================================================

/// Everything a flush needs, detached from the originating request so the
/// background path can outlive its caller.
#[derive(Clone)]
struct FlushContext {
    entry: CacheEntry,
    buf: Arc<WriteBuffer>,
    data_creation_elapsed: Duration,
    cleanup: Arc<dyn CleanupManager>,
    file_writer: FileWriter,
    evict_and_write_locks: Arc<KeyedLockRegistry>,
    stats: Arc<CacheStats>,
    max_queued_bytes: i64,
    wait_for_identical_requests: Duration,
    wait_for_identical_disk_writes: Duration,
}

impl FlushContext {
    /// Background flush entry point. Runs under its own token: cancelling
    /// the originating request must not abandon a write the caller already
    /// observed as a miss.
    async fn run_background(self) {
        let cancel = CancellationToken::new();
        let producer_ms = self.data_creation_elapsed.as_millis() as u64;
        match self.run_synchronized(false, &cancel).await {
            Ok(detail) => {
                debug!(
                    key = %self.entry.relative_path,
                    detail = ?detail,
                    producer_ms = producer_ms,
                    "Background flush finished"
                );
            }
            Err(err) => {
                self.stats.flush_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    key = %self.entry.relative_path,
                    error = %err,
                    "Background flush failed"
                );
            }
        }
    }

    /// Flush under the key's evict-and-write lock.
    async fn run_synchronized(
        &self,
        queue_full: bool,
        cancel: &CancellationToken,
    ) -> Result<CacheDetail> {
        let detail = match self
            .evict_and_write_locks
            .acquire(
                &self.entry.string_key,
                self.wait_for_identical_requests,
                cancel,
            )
            .await?
        {
            Some(_guard) => self.flush_inner(queue_full, cancel).await?,
            None => {
                warn!(key = %self.entry.relative_path, "Evict-and-write lock timed out");
                CacheDetail::EvictAndWriteLockTimedOut
            }
        };

        match detail {
            CacheDetail::WriteSucceeded => {
                self.stats.writes_succeeded.fetch_add(1, Ordering::Relaxed);
            }
            CacheDetail::CacheEvictionFailed
            | CacheDetail::WriteTimedOut
            | CacheDetail::EvictAndWriteLockTimedOut => {
                self.stats.flush_failures.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        Ok(detail)
    }

    async fn flush_inner(
        &self,
        queue_full: bool,
        cancel: &CancellationToken,
    ) -> Result<CacheDetail> {
        // Background flushes never evict; only the synchronous path (and
        // hosts that disabled queuing outright) may push other files out.
        let allow_eviction = queue_full || self.max_queued_bytes <= 0;

        let reservation = self
            .cleanup
            .try_reserve_space(
                &self.entry,
                self.buf.content_type(),
                self.buf.used_bytes(),
                allow_eviction,
                &self.evict_and_write_locks,
                cancel,
            )
            .await?;
        if !reservation.success {
            warn!(
                key = %self.entry.relative_path,
                size = self.buf.used_bytes(),
                reason = reservation.message.as_deref().unwrap_or("unknown"),
                "Could not reserve cache space"
            );
            return Ok(CacheDetail::CacheEvictionFailed);
        }

        // The async path re-verifies existence: it may have lost a race
        // since the queue-lock re-check. The synchronous path just performed
        // that re-check and skips the probe.
        let outcome = self
            .file_writer
            .try_write(
                &self.entry,
                self.buf.bytes(),
                !queue_full,
                self.wait_for_identical_disk_writes,
                cancel,
            )
            .await?;

        self.cleanup
            .mark_file_created(
                &self.entry,
                self.buf.content_type(),
                self.buf.used_bytes(),
                SystemTime::now(),
            )
            .await;

        Ok(match outcome {
            WriteOutcome::FileCreated => CacheDetail::WriteSucceeded,
            WriteOutcome::FileAlreadyExists => CacheDetail::FileAlreadyExists,
            WriteOutcome::LockTimeout => CacheDetail::WriteTimedOut,
        })
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Hybrid memory + disk cache coordinator.
pub struct HybridCache {
    config: HybridCacheConfig,
    path_builder: Arc<dyn PathBuilder>,
    cleanup: Arc<dyn CleanupManager>,
    queue: Arc<WriteQueue>,
    file_writer: FileWriter,
    queue_locks: Arc<KeyedLockRegistry>,
    file_write_locks: Arc<KeyedLockRegistry>,
    evict_and_write_locks: Arc<KeyedLockRegistry>,
    stats: Arc<CacheStats>,
}

impl HybridCache {
    pub fn new(
        config: HybridCacheConfig,
        path_builder: Arc<dyn PathBuilder>,
        cleanup: Arc<dyn CleanupManager>,
    ) -> Self {
        Self::with_overwrite_hook(config, path_builder, cleanup, None)
    }

    /// Construct with a platform-specific atomic-replace hook for the
    /// final move of a written file.
    pub fn with_overwrite_hook(
        config: HybridCacheConfig,
        path_builder: Arc<dyn PathBuilder>,
        cleanup: Arc<dyn CleanupManager>,
        overwrite: Option<MoveFileOverwriteFn>,
    ) -> Self {
        let file_write_locks = KeyedLockRegistry::new();
        let file_writer = FileWriter::new(
            Arc::clone(&file_write_locks),
            config.move_files_into_place,
            overwrite,
        );

        info!(
            max_queued_bytes = config.max_queued_bytes,
            write_synchronously_when_queue_full = config.write_synchronously_when_queue_full,
            "Hybrid cache initialized"
        );

        Self {
            queue: WriteQueue::new(config.max_queued_bytes),
            file_writer,
            queue_locks: KeyedLockRegistry::new(),
            file_write_locks,
            evict_and_write_locks: KeyedLockRegistry::new(),
            stats: Arc::new(CacheStats::default()),
            config,
            path_builder,
            cleanup,
        }
    }

    pub fn config(&self) -> &HybridCacheConfig {
        &self.config
    }

    /// Bytes currently held by unflushed write buffers.
    pub fn queued_bytes(&self) -> u64 {
        self.queue.queued_bytes()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Await every background flush spawned so far. Hosts call this before
    /// shutdown; otherwise in-flight flushes may be lost.
    pub async fn await_all(&self) {
        self.queue.await_all().await;
    }

    /// Return the artifact for `key`, producing and persisting it on a miss.
    ///
    /// The producer runs at most once across concurrent identical requests,
    /// except for callers whose dedup-lock wait timed out (see
    /// [`CacheDetail::QueueLockTimeoutAndCreated`]). The returned reader is
    /// always valid regardless of whether the artifact ends up persisted.
    pub async fn get_or_create<P, Fut>(
        &self,
        key: &[u8],
        producer: P,
        cancel: CancellationToken,
        want_content_type: bool,
    ) -> Result<CacheResult>
    where
        P: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(Bytes, Option<String>)>>,
    {
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        let entry = self.path_builder.derive(key);

        // LRU touch for the metadata layer.
        self.cleanup.notify_used(&entry).await;

        // Fast disk probe, no locks. A locked file falls through to
        // the synchronized re-check rather than waiting here.
        if let Some(file) = disk::probe(&entry.physical_path).await? {
            self.stats.disk_hits.fetch_add(1, Ordering::Relaxed);
            let content_type = self
                .content_type_if_wanted(&entry, want_content_type, &cancel)
                .await?;
            debug!(key = %entry.relative_path, "Disk hit");
            return Ok(CacheResult {
                detail: CacheDetail::DiskHit,
                reader: Some(CacheReader::File(file)),
                content_type,
            });
        }

        // Dedup lock: identical requests collapse to one producer.
        let Some(_queue_guard) = self
            .queue_locks
            .acquire(
                &entry.string_key,
                self.config.wait_for_identical_requests(),
                &cancel,
            )
            .await?
        else {
            return self.queue_lock_timeout_fallback(entry, producer, cancel).await;
        };

        // A concurrent request may have parked its buffer already.
        if let Some(existing) = self.queue.get(&entry.string_key) {
            self.stats.memory_hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %entry.relative_path, "Memory hit from pending write");
            return Ok(CacheResult {
                detail: CacheDetail::MemoryHit,
                reader: Some(existing.reader()),
                content_type: existing.content_type().map(Into::into),
            });
        }
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        // Disk re-check, this time waiting out a concurrent writer.
        if let Some((file, contended)) = self.open_synchronized(&entry, &cancel).await? {
            let detail = if contended {
                self.stats.contended_disk_hits.fetch_add(1, Ordering::Relaxed);
                CacheDetail::ContendedDiskHit
            } else {
                self.stats.disk_hits.fetch_add(1, Ordering::Relaxed);
                CacheDetail::DiskHit
            };
            let content_type = self
                .content_type_if_wanted(&entry, want_content_type, &cancel)
                .await?;
            debug!(key = %entry.relative_path, contended = contended, "Disk hit under dedup lock");
            return Ok(CacheResult {
                detail,
                reader: Some(CacheReader::File(file)),
                content_type,
            });
        }
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        // Miss confirmed; synthesize the artifact.
        let produce_started = Instant::now();
        let (bytes, content_type) = producer(cancel.clone()).await?;
        let data_creation_elapsed = produce_started.elapsed();
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        // Park the artifact and prepare the caller's view
        // before any flush outcome can interfere with it.
        let buf = Arc::new(WriteBuffer::new(
            entry.string_key.clone(),
            bytes,
            content_type.clone(),
        ));
        let reader = buf.reader();
        let mut detail = CacheDetail::Miss;

        let ctx = FlushContext {
            entry,
            buf: Arc::clone(&buf),
            data_creation_elapsed,
            cleanup: Arc::clone(&self.cleanup),
            file_writer: self.file_writer.clone(),
            evict_and_write_locks: Arc::clone(&self.evict_and_write_locks),
            stats: Arc::clone(&self.stats),
            max_queued_bytes: self.config.max_queued_bytes,
            wait_for_identical_requests: self.config.wait_for_identical_requests(),
            wait_for_identical_disk_writes: self.config.wait_for_identical_disk_writes(),
        };

        // Hand the buffer to the background flush.
        let outcome = self.queue.enqueue(Arc::clone(&buf), {
            let ctx = ctx.clone();
            move || ctx.run_background()
        });

        // A saturated queue degrades to an inline flush (or to an
        // uncached miss when synchronous writes are disabled).
        if outcome == EnqueueOutcome::QueueFull {
            self.stats.queue_full_rejections.fetch_add(1, Ordering::Relaxed);
            if self.config.write_synchronously_when_queue_full {
                detail = ctx.run_synchronized(true, &cancel).await?;
            }
        }

        Ok(CacheResult {
            detail,
            reader: Some(reader),
            content_type,
        })
    }

    /// Dedup-lock timeout fallback: either fail the request or produce bytes
    /// this caller keeps to itself (never cached).
    async fn queue_lock_timeout_fallback<P, Fut>(
        &self,
        entry: CacheEntry,
        producer: P,
        cancel: CancellationToken,
    ) -> Result<CacheResult>
    where
        P: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(Bytes, Option<String>)>>,
    {
        self.stats.queue_lock_timeouts.fetch_add(1, Ordering::Relaxed);

        if self.config.fail_on_enqueue_lock_timeout {
            warn!(key = %entry.relative_path, "Dedup lock timed out, failing request");
            return Ok(CacheResult {
                detail: CacheDetail::QueueLockTimeoutAndFailed,
                reader: None,
                content_type: None,
            });
        }

        warn!(key = %entry.relative_path, "Dedup lock timed out, producing uncached result");
        let (bytes, content_type) = producer(cancel.clone()).await?;
        Ok(CacheResult {
            detail: CacheDetail::QueueLockTimeoutAndCreated,
            reader: Some(CacheReader::Memory(Cursor::new(bytes))),
            content_type,
        })
    }

    /// Disk re-check under the dedup lock. A locked file is waited out
    /// under the file-write lock so the retry loop cannot race the writer
    /// it is waiting for; the bool reports whether the wait loop ran.
    async fn open_synchronized(
        &self,
        entry: &CacheEntry,
        cancel: &CancellationToken,
    ) -> Result<Option<(File, bool)>> {
        match disk::try_open(&entry.physical_path).await? {
            OpenAttempt::Opened(file) => return Ok(Some((file, false))),
            OpenAttempt::Missing => return Ok(None),
            OpenAttempt::Locked => {}
        }

        let timeout = self.config.wait_for_identical_disk_writes();
        let Some(_guard) = self
            .file_write_locks
            .acquire(&entry.string_key, timeout, cancel)
            .await?
        else {
            return Ok(None);
        };

        match disk::open_when_unlocked(&entry.physical_path, timeout, cancel).await? {
            Some(file) => Ok(Some((file, true))),
            None => Ok(None),
        }
    }

    async fn content_type_if_wanted(
        &self,
        entry: &CacheEntry,
        want_content_type: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        if want_content_type {
            self.cleanup.get_content_type(entry, cancel).await
        } else {
            Ok(None)
        }
    }
}
