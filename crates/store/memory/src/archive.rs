use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use futures::stream;
use tokio::io::AsyncRead;

use tether_core::ArchiveRef;
use tether_store::archive::{
    ArchiveHeader, ArchiveStore, ArchiveStream, ArchiveUpload, DEFAULT_CHUNK_SIZE, StrayChunks,
    length_checked, read_chunk,
};
use tether_store::error::BlobError;

#[derive(Debug, Clone)]
struct StoredArchive {
    header: ArchiveHeader,
    chunks: Arc<Vec<Bytes>>,
}

/// In-memory [`ArchiveStore`] backed by a [`DashMap`].
///
/// An archive is inserted only after its reader is fully drained, so a
/// failed upload never leaves a visible header.
#[derive(Debug)]
pub struct MemoryArchiveStore {
    archives: DashMap<ArchiveRef, StoredArchive>,
    chunk_size: usize,
}

impl MemoryArchiveStore {
    /// Create an empty store using [`DEFAULT_CHUNK_SIZE`].
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    /// Create an empty store with a custom chunk size (minimum 1 byte).
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            archives: DashMap::new(),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Number of stored archives.
    pub fn len(&self) -> usize {
        self.archives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archives.is_empty()
    }
}

impl Default for MemoryArchiveStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArchiveStore for MemoryArchiveStore {
    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    async fn put(
        &self,
        upload: ArchiveUpload,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<ArchiveHeader, BlobError> {
        let mut chunks = Vec::new();
        let mut length = 0u64;
        while let Some(chunk) = read_chunk(reader, self.chunk_size)
            .await
            .map_err(|e| BlobError::Write(e.to_string()))?
        {
            length += chunk.len() as u64;
            chunks.push(chunk);
        }

        let chunk_size = u32::try_from(self.chunk_size).unwrap_or(u32::MAX);
        let header = upload.into_header(ArchiveRef::generate(), length, chunk_size);
        self.archives.insert(
            header.id.clone(),
            StoredArchive {
                header: header.clone(),
                chunks: Arc::new(chunks),
            },
        );
        Ok(header)
    }

    async fn get(&self, archive_ref: &ArchiveRef) -> Result<ArchiveStream, BlobError> {
        let stored = self
            .archives
            .get(archive_ref)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BlobError::NotFound(archive_ref.to_string()))?;

        let chunks = Arc::clone(&stored.chunks);
        let inner = stream::iter(0..chunks.len())
            .map(move |n| Ok(chunks[n].clone()))
            .boxed();
        Ok(length_checked(inner, stored.header.length))
    }

    async fn stat(&self, archive_ref: &ArchiveRef) -> Result<Option<ArchiveHeader>, BlobError> {
        Ok(self
            .archives
            .get(archive_ref)
            .map(|entry| entry.value().header.clone()))
    }

    async fn remove(&self, archive_ref: &ArchiveRef) -> Result<bool, BlobError> {
        Ok(self.archives.remove(archive_ref).is_some())
    }

    async fn list(&self) -> Result<Vec<ArchiveHeader>, BlobError> {
        let mut headers: Vec<ArchiveHeader> = self
            .archives
            .iter()
            .map(|entry| entry.value().header.clone())
            .collect();
        headers.sort_by(|a, b| {
            a.uploaded_at
                .cmp(&b.uploaded_at)
                .then_with(|| a.id.as_str().cmp(b.id.as_str()))
        });
        Ok(headers)
    }

    // Header and chunks are inserted together, so nothing can stray.
    async fn stray_chunks(&self) -> Result<Vec<StrayChunks>, BlobError> {
        Ok(Vec::new())
    }

    async fn discard_stray_chunks(&self) -> Result<u64, BlobError> {
        Ok(0)
    }
}
