//! Disk persistence for write buffers
//!
//! Writes a buffer to its cache path via a sibling temp file and an atomic
//! rename, under the per-key file-write lock so concurrent writers for the
//! same path serialize. An injected overwrite hook can replace the default
//! rename-if-not-exists policy with a platform-specific atomic replace.

use crate::entry::CacheEntry;
use crate::error::Result;
use crate::keyed_lock::KeyedLockRegistry;
use bytes::Bytes;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Outcome of a write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The artifact landed at its destination path.
    FileCreated,
    /// Another writer got there first; nothing was overwritten.
    FileAlreadyExists,
    /// The per-key file-write lock could not be acquired in time.
    LockTimeout,
}

/// Optional platform-specific atomic replace: `(temp, destination)`.
pub type MoveFileOverwriteFn = Arc<dyn Fn(&Path, &Path) -> io::Result<()> + Send + Sync>;

#[derive(Clone)]
pub struct FileWriter {
    locks: Arc<KeyedLockRegistry>,
    move_into_place: bool,
    overwrite: Option<MoveFileOverwriteFn>,
}

impl FileWriter {
    pub fn new(
        locks: Arc<KeyedLockRegistry>,
        move_into_place: bool,
        overwrite: Option<MoveFileOverwriteFn>,
    ) -> Self {
        Self {
            locks,
            move_into_place,
            overwrite,
        }
    }

    /// Persist `bytes` at `entry.physical_path` under the key's file-write
    /// lock. IO errors propagate; racing writers resolve to
    /// [`WriteOutcome::FileAlreadyExists`].
    pub async fn try_write(
        &self,
        entry: &CacheEntry,
        bytes: &Bytes,
        verify_file_exists_first: bool,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<WriteOutcome> {
        let Some(_guard) = self
            .locks
            .acquire(&entry.string_key, timeout, cancel)
            .await?
        else {
            warn!(key = %entry.relative_path, "File-write lock timed out");
            return Ok(WriteOutcome::LockTimeout);
        };

        if verify_file_exists_first && fs::metadata(&entry.physical_path).await.is_ok() {
            debug!(key = %entry.relative_path, "Destination already exists, skipping write");
            return Ok(WriteOutcome::FileAlreadyExists);
        }

        if let Some(parent) = entry.physical_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        if !self.move_into_place {
            write_file(&entry.physical_path, bytes).await?;
            debug!(key = %entry.relative_path, size = bytes.len(), "Wrote cache file in place");
            return Ok(WriteOutcome::FileCreated);
        }

        let temp = temp_path(&entry.physical_path);
        write_file(&temp, bytes).await?;

        if let Some(replace) = &self.overwrite {
            if let Err(err) = replace(&temp, &entry.physical_path) {
                let _ = fs::remove_file(&temp).await;
                return Err(err.into());
            }
            debug!(key = %entry.relative_path, size = bytes.len(), "Replaced cache file");
            return Ok(WriteOutcome::FileCreated);
        }

        if fs::metadata(&entry.physical_path).await.is_ok() {
            let _ = fs::remove_file(&temp).await;
            debug!(key = %entry.relative_path, "Lost write race, discarding temp file");
            return Ok(WriteOutcome::FileAlreadyExists);
        }

        if let Err(err) = fs::rename(&temp, &entry.physical_path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(err.into());
        }

        debug!(key = %entry.relative_path, size = bytes.len(), "Moved cache file into place");
        Ok(WriteOutcome::FileCreated)
    }
}

async fn write_file(path: &Path, bytes: &Bytes) -> io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

/// Sibling temp path so the final rename never crosses filesystems.
fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{}.{}.tmp", name, Uuid::new_v4()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry_in(dir: &Path, key: &str) -> CacheEntry {
        CacheEntry {
            string_key: key.to_string(),
            physical_path: dir.join("ab").join(key),
            relative_path: format!("ab/{key}"),
        }
    }

    fn writer(locks: &Arc<KeyedLockRegistry>) -> FileWriter {
        FileWriter::new(Arc::clone(locks), true, None)
    }

    async fn dir_entry_count(dir: &Path) -> usize {
        let mut count = 0;
        let mut entries = fs::read_dir(dir).await.unwrap();
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        count
    }

    #[tokio::test]
    async fn test_write_creates_file_and_parents() {
        let tmp = TempDir::new().unwrap();
        let locks = KeyedLockRegistry::new();
        let entry = entry_in(tmp.path(), "k1");
        let cancel = CancellationToken::new();

        let outcome = writer(&locks)
            .try_write(&entry, &Bytes::from_static(b"XY"), true, Duration::from_secs(1), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome, WriteOutcome::FileCreated);
        assert_eq!(fs::read(&entry.physical_path).await.unwrap(), b"XY");
        // No stray temp files left beside the artifact.
        assert_eq!(dir_entry_count(entry.physical_path.parent().unwrap()).await, 1);
    }

    #[tokio::test]
    async fn test_existing_destination_wins() {
        let tmp = TempDir::new().unwrap();
        let locks = KeyedLockRegistry::new();
        let entry = entry_in(tmp.path(), "k1");
        let cancel = CancellationToken::new();

        fs::create_dir_all(entry.physical_path.parent().unwrap())
            .await
            .unwrap();
        fs::write(&entry.physical_path, b"FIRST").await.unwrap();

        let outcome = writer(&locks)
            .try_write(&entry, &Bytes::from_static(b"SECOND"), true, Duration::from_secs(1), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome, WriteOutcome::FileAlreadyExists);
        assert_eq!(fs::read(&entry.physical_path).await.unwrap(), b"FIRST");
    }

    #[tokio::test]
    async fn test_race_after_skipped_verify_discards_temp() {
        let tmp = TempDir::new().unwrap();
        let locks = KeyedLockRegistry::new();
        let entry = entry_in(tmp.path(), "k1");
        let cancel = CancellationToken::new();

        fs::create_dir_all(entry.physical_path.parent().unwrap())
            .await
            .unwrap();
        fs::write(&entry.physical_path, b"FIRST").await.unwrap();

        // verify_file_exists_first=false still must not overwrite.
        let outcome = writer(&locks)
            .try_write(&entry, &Bytes::from_static(b"SECOND"), false, Duration::from_secs(1), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome, WriteOutcome::FileAlreadyExists);
        assert_eq!(fs::read(&entry.physical_path).await.unwrap(), b"FIRST");
        assert_eq!(dir_entry_count(entry.physical_path.parent().unwrap()).await, 1);
    }

    #[tokio::test]
    async fn test_overwrite_hook_replaces_destination() {
        let tmp = TempDir::new().unwrap();
        let locks = KeyedLockRegistry::new();
        let entry = entry_in(tmp.path(), "k1");
        let cancel = CancellationToken::new();

        fs::create_dir_all(entry.physical_path.parent().unwrap())
            .await
            .unwrap();
        fs::write(&entry.physical_path, b"FIRST").await.unwrap();

        let replace: MoveFileOverwriteFn = Arc::new(|temp, dest| std::fs::rename(temp, dest));
        let writer = FileWriter::new(Arc::clone(&locks), true, Some(replace));

        let outcome = writer
            .try_write(&entry, &Bytes::from_static(b"SECOND"), false, Duration::from_secs(1), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome, WriteOutcome::FileCreated);
        assert_eq!(fs::read(&entry.physical_path).await.unwrap(), b"SECOND");
    }

    #[tokio::test]
    async fn test_lock_timeout() {
        let tmp = TempDir::new().unwrap();
        let locks = KeyedLockRegistry::new();
        let entry = entry_in(tmp.path(), "k1");
        let cancel = CancellationToken::new();

        let _held = locks
            .acquire(&entry.string_key, Duration::from_secs(1), &cancel)
            .await
            .unwrap()
            .unwrap();

        let outcome = writer(&locks)
            .try_write(&entry, &Bytes::from_static(b"XY"), true, Duration::from_millis(20), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome, WriteOutcome::LockTimeout);
        assert!(fs::metadata(&entry.physical_path).await.is_err());
    }

    #[tokio::test]
    async fn test_write_in_place_overwrites() {
        let tmp = TempDir::new().unwrap();
        let locks = KeyedLockRegistry::new();
        let entry = entry_in(tmp.path(), "k1");
        let cancel = CancellationToken::new();

        let writer = FileWriter::new(Arc::clone(&locks), false, None);
        writer
            .try_write(&entry, &Bytes::from_static(b"ONE"), false, Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        let outcome = writer
            .try_write(&entry, &Bytes::from_static(b"TWO"), false, Duration::from_secs(1), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome, WriteOutcome::FileCreated);
        assert_eq!(fs::read(&entry.physical_path).await.unwrap(), b"TWO");
    }
}
