use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use sqlx::PgPool;
use tokio::io::AsyncRead;
use tracing::{debug, warn};

use tether_core::ArchiveRef;
use tether_store::archive::{
    ArchiveHeader, ArchiveStore, ArchiveStream, ArchiveUpload, StrayChunks, length_checked,
    read_chunk,
};
use tether_store::error::BlobError;

use crate::config::PostgresConfig;

type HeaderRow = (String, String, i64, i32, DateTime<Utc>, String);

fn header_from_row(row: HeaderRow) -> Result<ArchiveHeader, BlobError> {
    let (id, filename, length, chunk_size, uploaded_at, metadata) = row;
    let length = u64::try_from(length)
        .map_err(|_| BlobError::Backend(format!("negative length for archive {id}")))?;
    let chunk_size = u32::try_from(chunk_size)
        .map_err(|_| BlobError::Backend(format!("negative chunk size for archive {id}")))?;
    let metadata: BTreeMap<String, String> =
        serde_json::from_str(&metadata).map_err(|e| BlobError::Backend(e.to_string()))?;
    Ok(ArchiveHeader {
        id: ArchiveRef::new(id),
        filename,
        length,
        chunk_size,
        uploaded_at,
        metadata,
    })
}

/// PostgreSQL-backed implementation of [`ArchiveStore`].
///
/// Chunks go to `{prefix}{bucket}_chunks` keyed by `(files_id, n)`; the
/// header row in `{prefix}{bucket}_files` is inserted last, so an archive
/// only becomes resolvable once every chunk is committed.
pub struct PostgresArchiveStore {
    pool: PgPool,
    config: Arc<PostgresConfig>,
}

impl PostgresArchiveStore {
    /// Create a store over an existing pool.
    ///
    /// Does not run migrations; call [`crate::run_migrations`] first.
    pub fn new(pool: PgPool, config: PostgresConfig) -> Self {
        Self {
            pool,
            config: Arc::new(config),
        }
    }

    async fn write_chunks(
        &self,
        files_id: &ArchiveRef,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, BlobError> {
        let insert = format!(
            "INSERT INTO {} (files_id, n, data) VALUES ($1, $2, $3)",
            self.config.chunks_table()
        );

        let mut n: i32 = 0;
        let mut length = 0u64;
        while let Some(chunk) = read_chunk(reader, self.config.chunk_size)
            .await
            .map_err(|e| BlobError::Write(e.to_string()))?
        {
            sqlx::query(&insert)
                .bind(files_id.as_str())
                .bind(n)
                .bind(chunk.as_ref())
                .execute(&self.pool)
                .await
                .map_err(|e| BlobError::Write(format!("chunk {n}: {e}")))?;
            length += chunk.len() as u64;
            n = n
                .checked_add(1)
                .ok_or_else(|| BlobError::Write("too many chunks".into()))?;
        }
        Ok(length)
    }

    async fn write_header(&self, header: &ArchiveHeader) -> Result<(), BlobError> {
        let insert = format!(
            "INSERT INTO {} (id, filename, length, chunk_size, uploaded_at, metadata)
             VALUES ($1, $2, $3, $4, $5, $6)",
            self.config.files_table()
        );
        let metadata =
            serde_json::to_string(&header.metadata).map_err(|e| BlobError::Write(e.to_string()))?;
        let length = i64::try_from(header.length)
            .map_err(|_| BlobError::Write("archive too large".into()))?;
        let chunk_size = i32::try_from(header.chunk_size)
            .map_err(|_| BlobError::Write("chunk size too large".into()))?;

        sqlx::query(&insert)
            .bind(header.id.as_str())
            .bind(&header.filename)
            .bind(length)
            .bind(chunk_size)
            .bind(header.uploaded_at)
            .bind(metadata)
            .execute(&self.pool)
            .await
            .map_err(|e| BlobError::Write(format!("header: {e}")))?;
        Ok(())
    }

    /// Best-effort removal of chunks left by a failed upload.
    async fn discard_chunks(&self, files_id: &ArchiveRef) {
        let delete = format!("DELETE FROM {} WHERE files_id = $1", self.config.chunks_table());
        if let Err(e) = sqlx::query(&delete)
            .bind(files_id.as_str())
            .execute(&self.pool)
            .await
        {
            warn!(archive_ref = %files_id, error = %e, "failed to discard chunks of aborted upload");
        }
    }
}

#[async_trait]
impl ArchiveStore for PostgresArchiveStore {
    fn chunk_size(&self) -> usize {
        self.config.chunk_size
    }

    async fn put(
        &self,
        upload: ArchiveUpload,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<ArchiveHeader, BlobError> {
        let chunk_size = u32::try_from(self.config.chunk_size)
            .map_err(|_| BlobError::Write("chunk size too large".into()))?;
        let id = ArchiveRef::generate();

        let length = match self.write_chunks(&id, reader).await {
            Ok(length) => length,
            Err(e) => {
                self.discard_chunks(&id).await;
                return Err(e);
            }
        };

        let header = upload.into_header(id, length, chunk_size);
        if let Err(e) = self.write_header(&header).await {
            self.discard_chunks(&header.id).await;
            return Err(e);
        }

        debug!(
            archive_ref = %header.id,
            length = header.length,
            chunks = header.chunk_count(),
            "archive uploaded"
        );
        Ok(header)
    }

    async fn get(&self, archive_ref: &ArchiveRef) -> Result<ArchiveStream, BlobError> {
        let header = self
            .stat(archive_ref)
            .await?
            .ok_or_else(|| BlobError::NotFound(archive_ref.to_string()))?;

        let count = i32::try_from(header.chunk_count())
            .map_err(|_| BlobError::Read("chunk count out of range".into()))?;
        let query = format!(
            "SELECT data FROM {} WHERE files_id = $1 AND n = $2",
            self.config.chunks_table()
        );
        let pool = self.pool.clone();
        let files_id = header.id.to_string();

        let chunks = futures::stream::try_unfold(0i32, move |n| {
            let pool = pool.clone();
            let query = query.clone();
            let files_id = files_id.clone();
            async move {
                if n >= count {
                    return Ok(None);
                }
                let row: Option<(Vec<u8>,)> = sqlx::query_as(&query)
                    .bind(&files_id)
                    .bind(n)
                    .fetch_optional(&pool)
                    .await
                    .map_err(|e| BlobError::Read(e.to_string()))?;
                match row {
                    Some((data,)) => Ok(Some((Bytes::from(data), n + 1))),
                    None => Err(BlobError::Read(format!(
                        "missing chunk {n} of archive {files_id}"
                    ))),
                }
            }
        })
        .boxed();

        Ok(length_checked(chunks, header.length))
    }

    async fn stat(&self, archive_ref: &ArchiveRef) -> Result<Option<ArchiveHeader>, BlobError> {
        let query = format!(
            "SELECT id, filename, length, chunk_size, uploaded_at, metadata FROM {} WHERE id = $1",
            self.config.files_table()
        );
        let row: Option<HeaderRow> = sqlx::query_as(&query)
            .bind(archive_ref.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BlobError::Backend(e.to_string()))?;
        row.map(header_from_row).transpose()
    }

    async fn remove(&self, archive_ref: &ArchiveRef) -> Result<bool, BlobError> {
        let delete_header = format!("DELETE FROM {} WHERE id = $1", self.config.files_table());
        let delete_chunks = format!("DELETE FROM {} WHERE files_id = $1", self.config.chunks_table());

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BlobError::Connection(e.to_string()))?;

        let header = sqlx::query(&delete_header)
            .bind(archive_ref.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| BlobError::Backend(e.to_string()))?;
        sqlx::query(&delete_chunks)
            .bind(archive_ref.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| BlobError::Backend(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| BlobError::Backend(e.to_string()))?;

        Ok(header.rows_affected() > 0)
    }

    async fn list(&self) -> Result<Vec<ArchiveHeader>, BlobError> {
        let query = format!(
            "SELECT id, filename, length, chunk_size, uploaded_at, metadata FROM {}
             ORDER BY uploaded_at, id",
            self.config.files_table()
        );
        let rows: Vec<HeaderRow> = sqlx::query_as(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BlobError::Backend(e.to_string()))?;
        rows.into_iter().map(header_from_row).collect()
    }

    /// An upload still writing its chunks is reported here too until its
    /// header lands.
    async fn stray_chunks(&self) -> Result<Vec<StrayChunks>, BlobError> {
        let query = format!(
            "SELECT c.files_id, COUNT(*)::BIGINT, COALESCE(SUM(octet_length(c.data)), 0)::BIGINT
             FROM {chunks} c
             WHERE NOT EXISTS (SELECT 1 FROM {files} f WHERE f.id = c.files_id)
             GROUP BY c.files_id
             ORDER BY c.files_id",
            chunks = self.config.chunks_table(),
            files = self.config.files_table(),
        );
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BlobError::Backend(e.to_string()))?;
        Ok(rows
            .into_iter()
            .map(|(files_id, chunks, bytes)| StrayChunks {
                files_id: ArchiveRef::new(files_id),
                chunks: u64::try_from(chunks).unwrap_or_default(),
                bytes: u64::try_from(bytes).unwrap_or_default(),
            })
            .collect())
    }

    async fn discard_stray_chunks(&self) -> Result<u64, BlobError> {
        let delete = format!(
            "DELETE FROM {chunks} c
             WHERE NOT EXISTS (SELECT 1 FROM {files} f WHERE f.id = c.files_id)",
            chunks = self.config.chunks_table(),
            files = self.config.files_table(),
        );
        let result = sqlx::query(&delete)
            .execute(&self.pool)
            .await
            .map_err(|e| BlobError::Backend(e.to_string()))?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_row_round_trips_metadata() {
        let row: HeaderRow = (
            "0190-abc".into(),
            "main.zip".into(),
            300,
            128,
            Utc::now(),
            r#"{"kind":"messaging-session","session_id":"main"}"#.into(),
        );
        let header = header_from_row(row).unwrap();
        assert_eq!(header.id.as_str(), "0190-abc");
        assert_eq!(header.chunk_count(), 3);
        assert_eq!(header.meta("session_id"), Some("main"));
    }

    #[test]
    fn header_row_rejects_negative_length() {
        let row: HeaderRow = ("x".into(), "x.zip".into(), -1, 128, Utc::now(), "{}".into());
        assert!(matches!(header_from_row(row), Err(BlobError::Backend(_))));
    }
}
