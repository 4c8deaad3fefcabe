//! Hybrid Cache Core - memory + disk content-addressed artifact cache
//!
//! Serves on-demand derivatives (resized images, transcoded variants) from a
//! bounded disk cache, deduplicating concurrent identical requests and
//! bounding the memory held by not-yet-flushed writes.
//!
//! ## Architecture
//!
//! | Component | Responsibility |
//! |-----------|----------------|
//! | [`HybridCache`] | `get_or_create` entry point composing everything below |
//! | [`KeyedLockRegistry`] | Named async mutexes: dedup, file-write, evict-and-write domains |
//! | [`WriteQueue`] | Byte-bounded set of pending [`WriteBuffer`]s + background flush tasks |
//! | [`FileWriter`] | Temp-file + atomic-rename persistence under the per-key write lock |
//! | [`CleanupManager`] | Injected metadata + eviction collaborator owning the size budget |
//! | [`PathBuilder`] | Injected fingerprint-to-path derivation |
//!
//! ## Storage Layout
//!
//! With the shipped [`HashedPathBuilder`]:
//!
//! ```text
//! {cache_root}/
//!   ab/
//!     cd/
//!       abcdef123456...   # artifact bytes, SHA-256 of the fingerprint key
//! ```
//!
//! ## Guarantees
//!
//! - Concurrent identical requests run the producer at most once (barring a
//!   dedup-lock timeout, which each result reports explicitly).
//! - Every returned stream yields bytes identical to the producer's output.
//! - Queued-but-unflushed buffers never exceed the configured byte bound.
//! - Writers for the same path serialize; the cache file appears atomically
//!   via rename.
//! - Cancelling a request never abandons a flush that was already spawned.
//!
//! Hosts should call [`HybridCache::await_all`] before shutdown so in-flight
//! background flushes reach disk.

pub mod cleanup;
pub mod config;
pub mod coordinator;
pub mod disk;
pub mod entry;
pub mod error;
pub mod file_writer;
pub mod keyed_lock;
pub mod write_buffer;
pub mod write_queue;

// Re-exports
pub use cleanup::{CleanupManager, FileRecord, MemoryCleanupManager, SpaceReservation};
pub use config::HybridCacheConfig;
pub use coordinator::{CacheDetail, CacheResult, HybridCache, StatsSnapshot};
pub use entry::{CacheEntry, HashedPathBuilder, PathBuilder};
pub use error::{CacheError, Result};
pub use file_writer::{FileWriter, MoveFileOverwriteFn, WriteOutcome};
pub use keyed_lock::{KeyedLockGuard, KeyedLockRegistry};
pub use write_buffer::{CacheReader, WriteBuffer};
pub use write_queue::{EnqueueOutcome, WriteQueue};
