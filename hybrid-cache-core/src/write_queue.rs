//! Byte-bounded queue of pending writes
//!
//! Maps `string_key` to its pending [`WriteBuffer`] so concurrent identical
//! requests can be served from memory while the flush is in flight. The sum
//! of queued artifact bytes never exceeds the configured bound after a
//! successful enqueue; an entry is removed only once its flush task has
//! completed, success or failure.

use crate::write_buffer::WriteBuffer;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Outcome of an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Buffer accepted; a background flush task was spawned.
    Enqueued,
    /// Accepting the buffer would exceed the byte bound, or async queuing
    /// is disabled. Nothing was added.
    QueueFull,
}

struct QueueInner {
    entries: HashMap<String, Arc<WriteBuffer>>,
    queued_bytes: u64,
    flush_tasks: Vec<JoinHandle<()>>,
}

/// Bounded set of write buffers keyed by fingerprint, plus the spawned
/// flush tasks draining them to disk.
pub struct WriteQueue {
    max_queued_bytes: i64,
    inner: Mutex<QueueInner>,
}

impl WriteQueue {
    /// `max_queued_bytes <= 0` disables async queuing: every enqueue
    /// reports [`EnqueueOutcome::QueueFull`].
    pub fn new(max_queued_bytes: i64) -> Arc<Self> {
        Arc::new(Self {
            max_queued_bytes,
            inner: Mutex::new(QueueInner {
                entries: HashMap::new(),
                queued_bytes: 0,
                flush_tasks: Vec::new(),
            }),
        })
    }

    /// Look up the pending buffer for a key. O(1).
    pub fn get(&self, string_key: &str) -> Option<Arc<WriteBuffer>> {
        let inner = self.inner.lock().expect("write queue poisoned");
        inner.entries.get(string_key).cloned()
    }

    /// Sum of artifact bytes currently queued.
    pub fn queued_bytes(&self) -> u64 {
        self.inner.lock().expect("write queue poisoned").queued_bytes
    }

    /// Insert a buffer and spawn the flush task built by `flush_factory`.
    /// The factory is invoked only when the buffer is actually accepted;
    /// the entry is removed and its bytes released when the task finishes.
    pub fn enqueue<F, Fut>(self: &Arc<Self>, buf: Arc<WriteBuffer>, flush_factory: F) -> EnqueueOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let size = buf.used_bytes();
        let key = buf.string_key().to_string();

        let mut inner = self.inner.lock().expect("write queue poisoned");
        if self.max_queued_bytes <= 0 || inner.queued_bytes + size > self.max_queued_bytes as u64 {
            debug!(
                key = %key,
                size = size,
                queued = inner.queued_bytes,
                "Write queue full, rejecting buffer"
            );
            return EnqueueOutcome::QueueFull;
        }

        if let Some(old) = inner.entries.insert(key.clone(), Arc::clone(&buf)) {
            // The coordinator serializes same-key enqueues under the dedup
            // lock, so a replaced entry means its flush already completed.
            inner.queued_bytes -= old.used_bytes();
        }
        inner.queued_bytes += size;

        inner.flush_tasks.retain(|task| !task.is_finished());
        let queue = Arc::clone(self);
        let flush = flush_factory();
        inner.flush_tasks.push(tokio::spawn(async move {
            flush.await;
            queue.complete(&key, &buf);
        }));

        EnqueueOutcome::Enqueued
    }

    /// Drop an entry once its flush task finished (success or failure).
    fn complete(&self, key: &str, buf: &Arc<WriteBuffer>) {
        let mut inner = self.inner.lock().expect("write queue poisoned");
        if let Some(current) = inner.entries.get(key) {
            if Arc::ptr_eq(current, buf) {
                inner.queued_bytes -= current.used_bytes();
                inner.entries.remove(key);
            }
        }
    }

    /// Await every flush task spawned so far. Tasks enqueued while draining
    /// are awaited too, as long as they arrived before the call resolved.
    pub async fn await_all(&self) {
        loop {
            let tasks = {
                let mut inner = self.inner.lock().expect("write queue poisoned");
                std::mem::take(&mut inner.flush_tasks)
            };
            if tasks.is_empty() {
                return;
            }
            for joined in futures_util::future::join_all(tasks).await {
                if let Err(err) = joined {
                    warn!(error = %err, "Flush task panicked during drain");
                }
            }
        }
    }
}
