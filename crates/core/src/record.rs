use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ArchiveRef, SessionId};

/// Metadata row mapping a session id to its current archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Logical session identifier. Unique across the ledger.
    pub id: SessionId,
    /// The archive this record points at.
    pub archive_ref: ArchiveRef,
    /// Byte length of the archive at save time.
    pub size_bytes: u64,
    /// When the session was first saved.
    pub created_at: DateTime<Utc>,
    /// When the archive was last replaced.
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Build a fresh record stamped with the current time.
    #[must_use]
    pub fn new(id: SessionId, archive_ref: ArchiveRef, size_bytes: u64) -> Self {
        let now = Utc::now();
        Self {
            id,
            archive_ref,
            size_bytes,
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace the archive reference, keeping `created_at`.
    #[must_use]
    pub fn replaced(self, archive_ref: ArchiveRef, size_bytes: u64) -> Self {
        Self {
            archive_ref,
            size_bytes,
            updated_at: Utc::now(),
            ..self
        }
    }
}
