//! Notifications pushed by the store and the session manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::{ClientInfo, ClientStatus};
use crate::types::{ArchiveRef, SessionId};

/// Emitted by the session store after a state-changing operation succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    /// A new archive was uploaded and the ledger points at it.
    ArchivePersisted {
        session_id: SessionId,
        archive_ref: ArchiveRef,
        size_bytes: u64,
        at: DateTime<Utc>,
    },
    /// An archive was streamed back to local storage.
    ArchiveRestored {
        session_id: SessionId,
        size_bytes: u64,
        at: DateTime<Utc>,
    },
    /// The session record (and its archive) was removed.
    ArchiveDeleted {
        session_id: SessionId,
        at: DateTime<Utc>,
    },
}

impl StoreEvent {
    /// The session this event concerns.
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::ArchivePersisted { session_id, .. }
            | Self::ArchiveRestored { session_id, .. }
            | Self::ArchiveDeleted { session_id, .. } => session_id,
        }
    }
}

/// Emitted by the session manager as the client moves through its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The client status changed.
    StatusChanged {
        from: ClientStatus,
        to: ClientStatus,
    },
    /// A pairing code is ready to be shown to the user.
    PairingCodeIssued { code: String },
    /// The client is connected as the given account.
    Ready { info: ClientInfo },
    /// A periodic or shutdown backup finished.
    BackupCompleted { success: bool },
}
