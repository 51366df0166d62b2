use thiserror::Error;

use tether_core::SessionId;

/// Errors from large-object archive backends.
#[derive(Debug, Error)]
pub enum BlobError {
    /// No archive header matches the reference.
    #[error("archive not found: {0}")]
    NotFound(String),

    /// A chunk or the header could not be persisted.
    #[error("archive write failed: {0}")]
    Write(String),

    /// The chunk sequence could not be reconstructed.
    #[error("archive read failed: {0}")]
    Read(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Errors from session metadata ledger backends.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Why a session store operation did not succeed.
#[derive(Debug, Error)]
pub enum PersistError {
    /// No record exists for the session. Expected during first pairing.
    #[error("no stored session for {0}")]
    NotFound(SessionId),

    /// The local archive to upload is missing or unreadable.
    #[error("local archive {path} unavailable: {reason}")]
    ArchiveUnavailable { path: String, reason: String },

    /// The backing store rejected the upload or the metadata write.
    #[error("write failure: {0}")]
    WriteFailure(String),

    /// The stored archive could not be streamed back.
    #[error("read failure: {0}")]
    ReadFailure(String),

    /// The metadata lookup itself failed.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

impl PersistError {
    /// Whether this outcome is part of normal operation rather than a fault.
    #[must_use]
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_not_found_is_expected() {
        let id = SessionId::parse("main").unwrap();
        assert!(PersistError::NotFound(id).is_expected());
        assert!(!PersistError::WriteFailure("x".into()).is_expected());
        assert!(!PersistError::Ledger(LedgerError::Backend("down".into())).is_expected());
    }

    #[test]
    fn display_includes_path() {
        let err = PersistError::ArchiveUnavailable {
            path: "./missing.zip".into(),
            reason: "No such file or directory".into(),
        };
        assert!(err.to_string().contains("./missing.zip"));
    }
}
