use async_trait::async_trait;

use tether_core::{ArchiveRef, SessionId, SessionRecord};

use crate::error::LedgerError;

/// Source of truth mapping a session id to its current archive.
///
/// Implementations enforce at most one record per session id.
#[async_trait]
pub trait SessionLedger: Send + Sync {
    /// Look up the record for a session. Returns `None` if absent.
    async fn find(&self, id: &SessionId) -> Result<Option<SessionRecord>, LedgerError>;

    /// Insert or replace the record for a session.
    ///
    /// An existing record keeps its `created_at`; `updated_at` is set to now.
    async fn upsert(
        &self,
        id: &SessionId,
        archive_ref: &ArchiveRef,
        size_bytes: u64,
    ) -> Result<SessionRecord, LedgerError>;

    /// Delete the record. Returns `true` if a record was removed.
    async fn delete(&self, id: &SessionId) -> Result<bool, LedgerError>;

    /// All records, ordered by session id.
    async fn list(&self) -> Result<Vec<SessionRecord>, LedgerError>;
}
