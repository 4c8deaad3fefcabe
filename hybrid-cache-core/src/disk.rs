//! Disk probes and contended-read retry
//!
//! Opening a cache file can race the writer that is still holding it. The
//! probe classifies platform sharing/lock errors so the fast path can fall
//! through without waiting, while the synchronized path polls until the
//! writer releases the file or the timeout elapses.

use crate::error::{CacheError, Result};
use std::io::ErrorKind;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Classification of an open error for the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoErrorClass {
    /// The file does not exist; treat as a miss immediately.
    NotFound,
    /// Transient sharing/lock violation; retry until timeout.
    Locked,
    /// Anything else propagates to the caller.
    Other,
}

/// Classify an open error into the retry policy's classes.
///
/// Unix: raw errno 11 (EAGAIN), 13 (EACCES, a lock proxy on some network
/// filesystems), 16 (EBUSY). Windows: low 16 bits of the OS error equal to
/// 0x20 (sharing violation) or 0x21 (lock violation). Permission-denied is
/// treated as transient on both platforms and retried.
pub fn classify_io_error(err: &std::io::Error) -> IoErrorClass {
    if err.kind() == ErrorKind::NotFound {
        return IoErrorClass::NotFound;
    }

    if let Some(code) = err.raw_os_error() {
        #[cfg(unix)]
        if matches!(code, 11 | 13 | 16) {
            return IoErrorClass::Locked;
        }
        #[cfg(windows)]
        if matches!(code & 0xFFFF, 0x20 | 0x21) {
            return IoErrorClass::Locked;
        }
    }

    if err.kind() == ErrorKind::PermissionDenied {
        return IoErrorClass::Locked;
    }

    IoErrorClass::Other
}

/// Poll interval for the contended-read loop.
pub fn retry_interval(timeout: Duration) -> Duration {
    Duration::from_millis(15).min(timeout / 3)
}

/// One open attempt with the lock classification applied.
#[derive(Debug)]
pub enum OpenAttempt {
    Opened(File),
    Missing,
    Locked,
}

/// Try to open a cache file read-only, classifying the failure.
pub async fn try_open(path: &Path) -> Result<OpenAttempt> {
    match File::open(path).await {
        Ok(file) => Ok(OpenAttempt::Opened(file)),
        Err(err) => match classify_io_error(&err) {
            IoErrorClass::NotFound => Ok(OpenAttempt::Missing),
            IoErrorClass::Locked => Ok(OpenAttempt::Locked),
            IoErrorClass::Other => Err(err.into()),
        },
    }
}

/// Non-blocking fast probe: an opened stream, or `None` when the file is
/// missing or currently locked by a writer.
pub async fn probe(path: &Path) -> Result<Option<File>> {
    match try_open(path).await? {
        OpenAttempt::Opened(file) => Ok(Some(file)),
        OpenAttempt::Missing | OpenAttempt::Locked => Ok(None),
    }
}

/// Poll an existing-but-locked file until it opens or `timeout` elapses.
/// Must run under the key's file-write lock so the loop cannot race the
/// writer it is waiting for. A vanished file resolves to `None` immediately.
pub async fn open_when_unlocked(
    path: &Path,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Option<File>> {
    let started = Instant::now();
    let interval = retry_interval(timeout);

    loop {
        match try_open(path).await? {
            OpenAttempt::Opened(file) => return Ok(Some(file)),
            OpenAttempt::Missing => return Ok(None),
            OpenAttempt::Locked => {}
        }

        if started.elapsed() >= timeout {
            debug!(path = %path.display(), "Gave up waiting for locked cache file");
            return Ok(None);
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(CacheError::Cancelled),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
