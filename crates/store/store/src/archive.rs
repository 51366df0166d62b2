use std::collections::BTreeMap;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use tether_core::ArchiveRef;

use crate::error::BlobError;

/// Default chunk size: 255 KiB, small enough to stay well under per-row and
/// per-document limits of the backing stores.
pub const DEFAULT_CHUNK_SIZE: usize = 255 * 1024;

/// Value of the `kind` metadata key on session archives.
pub const ARCHIVE_KIND: &str = "messaging-session";

/// A lazy sequence of archive bytes, chunk by chunk in stored order.
pub type ArchiveStream = BoxStream<'static, Result<Bytes, BlobError>>;

/// Header record describing one stored archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveHeader {
    /// Reference under which the archive is stored.
    pub id: ArchiveRef,
    /// Logical file name (e.g. `main.zip`).
    pub filename: String,
    /// Total length in bytes.
    pub length: u64,
    /// Size of every chunk except possibly the last.
    pub chunk_size: u32,
    /// When the upload completed.
    pub uploaded_at: DateTime<Utc>,
    /// Free-form metadata (`session_id`, `kind`).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ArchiveHeader {
    /// Number of chunks the archive is split into.
    #[must_use]
    pub fn chunk_count(&self) -> u64 {
        if self.chunk_size == 0 {
            return 0;
        }
        self.length.div_ceil(u64::from(self.chunk_size))
    }

    /// Look up a metadata value.
    #[must_use]
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

/// Chunks stored under an archive reference that has no header, left behind
/// by an upload that died before its header was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrayChunks {
    pub files_id: ArchiveRef,
    pub chunks: u64,
    pub bytes: u64,
}

/// Describes an archive about to be uploaded.
#[derive(Debug, Clone, Default)]
pub struct ArchiveUpload {
    pub filename: String,
    pub metadata: BTreeMap<String, String>,
}

impl ArchiveUpload {
    #[must_use]
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Build the header for a completed upload.
    #[must_use]
    pub fn into_header(self, id: ArchiveRef, length: u64, chunk_size: u32) -> ArchiveHeader {
        ArchiveHeader {
            id,
            filename: self.filename,
            length,
            chunk_size,
            uploaded_at: Utc::now(),
            metadata: self.metadata,
        }
    }
}

/// Chunked large-object storage for session archives.
///
/// Implementations must never make a partially written archive resolvable:
/// the header becomes visible only after every chunk is persisted.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Chunk size used for new uploads.
    fn chunk_size(&self) -> usize;

    /// Stream `reader` into the store and return the header once persisted.
    async fn put(
        &self,
        upload: ArchiveUpload,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<ArchiveHeader, BlobError>;

    /// Open a stream over the archive's bytes.
    ///
    /// Returns [`BlobError::NotFound`] if no header matches. Every call
    /// starts from the first chunk.
    async fn get(&self, archive_ref: &ArchiveRef) -> Result<ArchiveStream, BlobError>;

    /// Fetch the header only.
    async fn stat(&self, archive_ref: &ArchiveRef) -> Result<Option<ArchiveHeader>, BlobError>;

    /// Remove the header and all chunks. Returns `true` if the archive existed.
    async fn remove(&self, archive_ref: &ArchiveRef) -> Result<bool, BlobError>;

    /// List every stored header, oldest first.
    async fn list(&self) -> Result<Vec<ArchiveHeader>, BlobError>;

    /// Chunks with no matching header, grouped by archive reference.
    async fn stray_chunks(&self) -> Result<Vec<StrayChunks>, BlobError>;

    /// Delete every chunk with no matching header. Returns the number of
    /// chunks removed.
    async fn discard_stray_chunks(&self) -> Result<u64, BlobError>;
}

/// Read up to `chunk_size` bytes, filling the chunk unless the reader hits EOF.
///
/// Returns `None` once the reader is exhausted.
pub async fn read_chunk<R>(reader: &mut R, chunk_size: usize) -> std::io::Result<Option<Bytes>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; chunk_size];
    let mut filled = 0;
    while filled < chunk_size {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled == 0 {
        return Ok(None);
    }
    buf.truncate(filled);
    Ok(Some(Bytes::from(buf)))
}

/// Wrap a chunk stream so that it fails unless exactly `expected` bytes flow
/// through it.
pub fn length_checked(inner: ArchiveStream, expected: u64) -> ArchiveStream {
    Box::pin(LengthChecked {
        inner,
        expected,
        seen: 0,
        done: false,
    })
}

struct LengthChecked {
    inner: ArchiveStream,
    expected: u64,
    seen: u64,
    done: bool,
}

impl Stream for LengthChecked {
    type Item = Result<Bytes, BlobError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        match this.inner.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                this.seen += chunk.len() as u64;
                if this.seen > this.expected {
                    this.done = true;
                    return Poll::Ready(Some(Err(BlobError::Read(format!(
                        "archive longer than header length {}",
                        this.expected
                    )))));
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.done = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.done = true;
                if this.seen == this.expected {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Err(BlobError::Read(format!(
                        "archive truncated: read {} of {} bytes",
                        this.seen, this.expected
                    )))))
                }
            }
        }
    }
}
