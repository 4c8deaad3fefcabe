//! Named async mutex registry
//!
//! Provides per-name mutual exclusion with timeout: at most one task runs
//! under a given name at a time. Slots are created lazily and reference
//! counted; a slot is removed only when no holder or waiter references it,
//! so a waiter concurrent with release and removal always makes progress.
//! tokio's mutex queues waiters FIFO, which bounds starvation.

use crate::error::{CacheError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

struct LockSlot {
    mutex: Arc<AsyncMutex<()>>,
    /// Holders plus waiters currently referencing this slot.
    refs: usize,
}

/// Registry of named async locks. Lock names are canonicalized to lowercase.
pub struct KeyedLockRegistry {
    slots: Mutex<HashMap<String, LockSlot>>,
}

impl KeyedLockRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(HashMap::new()),
        })
    }

    /// Acquire the lock for `name`, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` when the lock could not be acquired in time and
    /// `Err(CacheError::Cancelled)` when the token fires while waiting.
    /// The returned guard releases the lock (and garbage-collects the slot
    /// when unreferenced) on drop.
    pub async fn acquire(
        self: &Arc<Self>,
        name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<KeyedLockGuard>> {
        let name = name.to_ascii_lowercase();

        let mutex = {
            let mut slots = self.slots.lock().expect("lock registry poisoned");
            let slot = slots.entry(name.clone()).or_insert_with(|| LockSlot {
                mutex: Arc::new(AsyncMutex::new(())),
                refs: 0,
            });
            slot.refs += 1;
            Arc::clone(&slot.mutex)
        };

        let acquired = tokio::select! {
            _ = cancel.cancelled() => Err(CacheError::Cancelled),
            locked = tokio::time::timeout(timeout, mutex.lock_owned()) => Ok(locked.ok()),
        };

        match acquired {
            Ok(Some(guard)) => Ok(Some(KeyedLockGuard {
                registry: Arc::clone(self),
                name,
                guard: Some(guard),
            })),
            Ok(None) => {
                self.release_ref(&name);
                Ok(None)
            }
            Err(err) => {
                self.release_ref(&name);
                Err(err)
            }
        }
    }

    /// Run `body` with the named lock held. Returns `Ok(None)` when the lock
    /// could not be acquired within `timeout`; cancellation while waiting is
    /// an error, cancellation inside `body` is the body's responsibility.
    pub async fn try_execute<F, Fut, T>(
        self: &Arc<Self>,
        name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
        body: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        match self.acquire(name, timeout, cancel).await? {
            Some(_guard) => Ok(Some(body().await)),
            None => Ok(None),
        }
    }

    fn release_ref(&self, name: &str) {
        let mut slots = self.slots.lock().expect("lock registry poisoned");
        if let Some(slot) = slots.get_mut(name) {
            slot.refs -= 1;
            if slot.refs == 0 {
                slots.remove(name);
            }
        }
    }

    /// Number of live slots (held or waited on).
    pub fn slot_count(&self) -> usize {
        self.slots.lock().expect("lock registry poisoned").len()
    }
}

/// Scoped holder of a named lock.
pub struct KeyedLockGuard {
    registry: Arc<KeyedLockRegistry>,
    name: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyedLockGuard {
    fn drop(&mut self) {
        // Release the mutex before dropping the slot reference so a queued
        // waiter observes the unlock while its refcount still pins the slot.
        self.guard.take();
        self.registry.release_ref(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_acquire_and_release_removes_slot() {
        let registry = KeyedLockRegistry::new();
        let cancel = CancellationToken::new();

        let guard = registry
            .acquire("Key-A", Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        assert!(guard.is_some());
        assert_eq!(registry.slot_count(), 1);

        drop(guard);
        assert_eq!(registry.slot_count(), 0);
    }

    #[tokio::test]
    async fn test_names_are_case_insensitive() {
        let registry = KeyedLockRegistry::new();
        let cancel = CancellationToken::new();

        let _guard = registry
            .acquire("ABC", Duration::from_secs(1), &cancel)
            .await
            .unwrap()
            .unwrap();
        let second = registry
            .acquire("abc", Duration::from_millis(20), &cancel)
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_timeout_returns_none() {
        let registry = KeyedLockRegistry::new();
        let cancel = CancellationToken::new();

        let _held = registry
            .acquire("k", Duration::from_secs(1), &cancel)
            .await
            .unwrap()
            .unwrap();

        let second = registry
            .acquire("k", Duration::from_millis(10), &cancel)
            .await
            .unwrap();
        assert!(second.is_none());
        // The timed-out waiter must not leak a slot reference.
        drop(_held);
        assert_eq!(registry.slot_count(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_while_waiting() {
        let registry = KeyedLockRegistry::new();
        let cancel = CancellationToken::new();

        let _held = registry
            .acquire("k", Duration::from_secs(1), &cancel)
            .await
            .unwrap()
            .unwrap();

        let registry2 = Arc::clone(&registry);
        let cancel2 = cancel.clone();
        let waiter = tokio::spawn(async move {
            registry2
                .acquire("k", Duration::from_secs(30), &cancel2)
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(CacheError::Cancelled)));
    }

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let registry = KeyedLockRegistry::new();
        let cancel = CancellationToken::new();
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            let cancel = cancel.clone();
            let running = Arc::clone(&running);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                registry
                    .try_execute("shared", Duration::from_secs(5), &cancel, || async {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                    .unwrap()
                    .expect("lock should be acquired within timeout");
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(registry.slot_count(), 0);
    }

    #[tokio::test]
    async fn test_independent_names_do_not_contend() {
        let registry = KeyedLockRegistry::new();
        let cancel = CancellationToken::new();

        let _a = registry
            .acquire("a", Duration::from_secs(1), &cancel)
            .await
            .unwrap()
            .unwrap();
        let b = registry
            .acquire("b", Duration::from_millis(10), &cancel)
            .await
            .unwrap();
        assert!(b.is_some());
    }
}
