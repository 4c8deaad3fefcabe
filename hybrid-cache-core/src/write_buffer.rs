//! In-memory pending artifact
//!
//! A [`WriteBuffer`] owns one produced artifact awaiting its disk flush.
//! The bytes are immutable after construction; any number of independent
//! readers may stream them concurrently while the flush proceeds.

use bytes::Bytes;
use std::io::Cursor;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncRead, ReadBuf};

/// One produced artifact pending its disk flush.
#[derive(Debug)]
pub struct WriteBuffer {
    string_key: String,
    bytes: Bytes,
    content_type: Option<String>,
    created_at: Instant,
}

impl WriteBuffer {
    pub fn new(string_key: String, bytes: Bytes, content_type: Option<String>) -> Self {
        Self {
            string_key,
            bytes,
            content_type,
            created_at: Instant::now(),
        }
    }

    pub fn string_key(&self) -> &str {
        &self.string_key
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Artifact length, not including bookkeeping overhead.
    pub fn used_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Fresh read-only view with an independent cursor over the shared bytes.
    pub fn reader(&self) -> CacheReader {
        CacheReader::Memory(Cursor::new(self.bytes.clone()))
    }
}

/// Readable stream handed back to the caller: either an opened cache file
/// or an in-memory cursor over a pending write buffer. The stream stays
/// readable regardless of the cache's subsequent internal decisions.
#[derive(Debug)]
pub enum CacheReader {
    Memory(Cursor<Bytes>),
    File(File),
}

impl AsyncRead for CacheReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            CacheReader::Memory(cursor) => Pin::new(cursor).poll_read(cx, buf),
            CacheReader::File(file) => Pin::new(file).poll_read(cx, buf),
        }
    }
}
