use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use tether_core::{SessionId, SessionRecord, StoreEvent};

use crate::archive::{ARCHIVE_KIND, ArchiveHeader, ArchiveStore, ArchiveUpload, StrayChunks};
use crate::error::{BlobError, PersistError};
use crate::ledger::SessionLedger;
use crate::lock::SessionLocks;

const EVENT_CAPACITY: usize = 64;

/// Snapshot of everything the store holds, for inspection.
#[derive(Debug, Clone, Serialize)]
pub struct Inventory {
    /// Every session record.
    pub records: Vec<SessionRecord>,
    /// Every archive header, linked or not.
    pub archives: Vec<ArchiveHeader>,
    /// Archives no record points at.
    pub orphans: Vec<ArchiveHeader>,
    /// Records whose archive is missing.
    pub dangling: Vec<SessionId>,
    /// Chunks whose archive header was never written.
    pub stray_chunks: Vec<StrayChunks>,
    /// Sum of all archive lengths.
    pub total_bytes: u64,
}

/// Durable session persistence composed from an archive store and a ledger.
///
/// The boolean operations never fail: errors are logged and reported as
/// `false`. The `try_*` variants return the cause.
pub struct SessionStore {
    archives: Arc<dyn ArchiveStore>,
    ledger: Arc<dyn SessionLedger>,
    locks: SessionLocks,
    events: broadcast::Sender<StoreEvent>,
}

impl SessionStore {
    pub fn new(archives: Arc<dyn ArchiveStore>, ledger: Arc<dyn SessionLedger>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            archives,
            ledger,
            locks: SessionLocks::new(),
            events,
        }
    }

    /// Subscribe to store events emitted after successful mutations.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn archives(&self) -> &Arc<dyn ArchiveStore> {
        &self.archives
    }

    pub fn ledger(&self) -> &Arc<dyn SessionLedger> {
        &self.ledger
    }

    // -- exists -------------------------------------------------------------

    /// Whether a record exists for `id`. Lookup failures read as `false`.
    pub async fn exists(&self, id: &SessionId) -> bool {
        match self.try_exists(id).await {
            Ok(found) => found,
            Err(e) => {
                error!(session_id = %id, error = %e, "session existence check failed");
                false
            }
        }
    }

    pub async fn try_exists(&self, id: &SessionId) -> Result<bool, PersistError> {
        Ok(self.ledger.find(id).await?.is_some())
    }

    // -- save ---------------------------------------------------------------

    /// Upload `path` as the archive for `id`, replacing any previous one.
    pub async fn save(&self, id: &SessionId, path: &Path) -> bool {
        match self.try_save(id, path).await {
            Ok(record) => {
                info!(
                    session_id = %id,
                    archive_ref = %record.archive_ref,
                    size_bytes = record.size_bytes,
                    "session saved"
                );
                true
            }
            Err(e) => {
                error!(session_id = %id, path = %path.display(), error = %e, "session save failed");
                false
            }
        }
    }

    pub async fn try_save(&self, id: &SessionId, path: &Path) -> Result<SessionRecord, PersistError> {
        let _guard = self.locks.acquire(id).await;

        let size = tokio::fs::metadata(path)
            .await
            .map_err(|e| unavailable(path, &e))?
            .len();

        // The old archive goes first. If it cannot be removed nothing has
        // changed yet, so bail out with the old session intact. Past this
        // point the record stays so a successful upsert keeps its created_at;
        // any failure below drops it.
        let previous = self.ledger.find(id).await?;
        if let Some(prev) = &previous {
            match self.archives.remove(&prev.archive_ref).await {
                Ok(true) => {}
                Ok(false) => {
                    info!(
                        session_id = %id,
                        archive_ref = %prev.archive_ref,
                        "previous archive already absent"
                    );
                }
                Err(e) => {
                    return Err(PersistError::WriteFailure(format!(
                        "removing previous archive {}: {e}",
                        prev.archive_ref
                    )));
                }
            }
        }

        let header = match self.upload(id, path).await {
            Ok(header) => header,
            Err(e) => {
                if previous.is_some() {
                    self.drop_stale_record(id).await;
                }
                return Err(e);
            }
        };

        if header.length != size {
            debug!(
                session_id = %id,
                expected = size,
                uploaded = header.length,
                "archive changed size while uploading"
            );
        }

        let record = match self.ledger.upsert(id, &header.id, header.length).await {
            Ok(record) => record,
            Err(e) => {
                if let Err(cleanup) = self.archives.remove(&header.id).await {
                    warn!(
                        session_id = %id,
                        archive_ref = %header.id,
                        error = %cleanup,
                        "failed to remove archive after ledger write failure"
                    );
                }
                if previous.is_some() {
                    self.drop_stale_record(id).await;
                }
                return Err(PersistError::WriteFailure(e.to_string()));
            }
        };

        let _ = self.events.send(StoreEvent::ArchivePersisted {
            session_id: id.clone(),
            archive_ref: record.archive_ref.clone(),
            size_bytes: record.size_bytes,
            at: Utc::now(),
        });
        Ok(record)
    }

    // -- extract ------------------------------------------------------------

    /// Stream the stored archive for `id` to `dest`.
    ///
    /// `dest` is only replaced once the full archive is on disk.
    pub async fn extract(&self, id: &SessionId, dest: &Path) -> bool {
        match self.try_extract(id, dest).await {
            Ok(size) => {
                info!(session_id = %id, size_bytes = size, "session extracted");
                true
            }
            Err(e) if e.is_expected() => {
                info!(session_id = %id, "no stored session to extract");
                false
            }
            Err(e) => {
                error!(session_id = %id, dest = %dest.display(), error = %e, "session extract failed");
                false
            }
        }
    }

    pub async fn try_extract(&self, id: &SessionId, dest: &Path) -> Result<u64, PersistError> {
        let _guard = self.locks.acquire(id).await;

        let record = self
            .ledger
            .find(id)
            .await?
            .ok_or_else(|| PersistError::NotFound(id.clone()))?;

        let stream = self.archives.get(&record.archive_ref).await.map_err(|e| match e {
            BlobError::NotFound(_) => {
                PersistError::ReadFailure(format!("record points at missing archive {}", record.archive_ref))
            }
            other => PersistError::ReadFailure(other.to_string()),
        })?;

        let partial = partial_path(dest);
        match write_stream(stream, dest, &partial).await {
            Ok(written) => {
                let _ = self.events.send(StoreEvent::ArchiveRestored {
                    session_id: id.clone(),
                    size_bytes: written,
                    at: Utc::now(),
                });
                Ok(written)
            }
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(&partial).await
                    && rm.kind() != std::io::ErrorKind::NotFound
                {
                    warn!(path = %partial.display(), error = %rm, "failed to remove partial archive");
                }
                Err(e)
            }
        }
    }

    // -- delete -------------------------------------------------------------

    /// Remove the record and archive for `id`. Returns whether a record existed.
    pub async fn delete(&self, id: &SessionId) -> bool {
        match self.try_delete(id).await {
            Ok(deleted) => {
                if deleted {
                    info!(session_id = %id, "session deleted");
                } else {
                    debug!(session_id = %id, "no session to delete");
                }
                deleted
            }
            Err(e) => {
                error!(session_id = %id, error = %e, "session delete failed");
                false
            }
        }
    }

    pub async fn try_delete(&self, id: &SessionId) -> Result<bool, PersistError> {
        let _guard = self.locks.acquire(id).await;
        let deleted = self.remove_session(id).await?;
        if deleted {
            let _ = self.events.send(StoreEvent::ArchiveDeleted {
                session_id: id.clone(),
                at: Utc::now(),
            });
        }
        Ok(deleted)
    }

    // -- inspection ---------------------------------------------------------

    /// The current record for `id`, if any.
    pub async fn record(&self, id: &SessionId) -> Result<Option<SessionRecord>, PersistError> {
        Ok(self.ledger.find(id).await?)
    }

    pub async fn inventory(&self) -> Result<Inventory, PersistError> {
        let records = self.ledger.list().await?;
        let archives = self
            .archives
            .list()
            .await
            .map_err(|e| PersistError::ReadFailure(e.to_string()))?;

        let linked: HashSet<&str> = records.iter().map(|r| r.archive_ref.as_str()).collect();
        let present: HashSet<&str> = archives.iter().map(|h| h.id.as_str()).collect();

        let orphans = archives
            .iter()
            .filter(|h| !linked.contains(h.id.as_str()))
            .cloned()
            .collect();
        let dangling = records
            .iter()
            .filter(|r| !present.contains(r.archive_ref.as_str()))
            .map(|r| r.id.clone())
            .collect();
        let total_bytes = archives.iter().map(|h| h.length).sum();
        let stray_chunks = self
            .archives
            .stray_chunks()
            .await
            .map_err(|e| PersistError::ReadFailure(e.to_string()))?;

        Ok(Inventory {
            records,
            archives,
            orphans,
            dangling,
            stray_chunks,
            total_bytes,
        })
    }

    /// Delete every session, every archive and every stray chunk. Returns
    /// the number of archives removed.
    pub async fn purge(&self) -> Result<u64, PersistError> {
        let mut removed = 0u64;

        for record in self.ledger.list().await? {
            let _guard = self.locks.acquire(&record.id).await;
            if self.remove_archive(&record.id, &record).await {
                removed += 1;
            }
            if self.ledger.delete(&record.id).await? {
                let _ = self.events.send(StoreEvent::ArchiveDeleted {
                    session_id: record.id.clone(),
                    at: Utc::now(),
                });
            }
        }

        let leftovers = self
            .archives
            .list()
            .await
            .map_err(|e| PersistError::ReadFailure(e.to_string()))?;
        for header in leftovers {
            match self.archives.remove(&header.id).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    return Err(PersistError::WriteFailure(e.to_string()));
                }
            }
        }

        let stray_chunks = self
            .archives
            .discard_stray_chunks()
            .await
            .map_err(|e| PersistError::WriteFailure(e.to_string()))?;

        info!(removed, stray_chunks, "store purged");
        Ok(removed)
    }

    // -- internals ----------------------------------------------------------

    async fn upload(&self, id: &SessionId, path: &Path) -> Result<ArchiveHeader, PersistError> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| unavailable(path, &e))?;
        let upload = ArchiveUpload::new(id.archive_file_name())
            .with_metadata("session_id", id.as_str())
            .with_metadata("kind", ARCHIVE_KIND);
        self.archives
            .put(upload, &mut file)
            .await
            .map_err(|e| PersistError::WriteFailure(e.to_string()))
    }

    /// Delete a record whose archive was already removed by a failed save.
    async fn drop_stale_record(&self, id: &SessionId) {
        if let Err(e) = self.ledger.delete(id).await {
            warn!(session_id = %id, error = %e, "failed to drop record after failed save");
        }
    }

    /// Remove the record and (best-effort) its archive. Caller holds the lock.
    async fn remove_session(&self, id: &SessionId) -> Result<bool, PersistError> {
        let Some(record) = self.ledger.find(id).await? else {
            return Ok(false);
        };
        self.remove_archive(id, &record).await;
        Ok(self.ledger.delete(id).await?)
    }

    async fn remove_archive(&self, id: &SessionId, record: &SessionRecord) -> bool {
        match self.archives.remove(&record.archive_ref).await {
            Ok(true) => true,
            Ok(false) => {
                info!(
                    session_id = %id,
                    archive_ref = %record.archive_ref,
                    "archive already absent"
                );
                false
            }
            Err(e) => {
                warn!(
                    session_id = %id,
                    archive_ref = %record.archive_ref,
                    error = %e,
                    "failed to remove archive"
                );
                false
            }
        }
    }
}

fn unavailable(path: &Path, e: &std::io::Error) -> PersistError {
    PersistError::ArchiveUnavailable {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

async fn write_stream(
    mut stream: crate::archive::ArchiveStream,
    dest: &Path,
    partial: &Path,
) -> Result<u64, PersistError> {
    let write_err = |e: std::io::Error| PersistError::ReadFailure(format!("{}: {e}", partial.display()));

    if let Some(parent) = dest.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }

    let mut file = tokio::fs::File::create(partial).await.map_err(write_err)?;
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| PersistError::ReadFailure(e.to_string()))?;
        file.write_all(&chunk).await.map_err(write_err)?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(write_err)?;
    file.sync_all().await.map_err(write_err)?;
    drop(file);

    tokio::fs::rename(partial, dest).await.map_err(write_err)?;
    Ok(written)
}
