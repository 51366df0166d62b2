use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;

/// Session id used when the configuration does not name one.
pub const DEFAULT_SESSION_ID: &str = "default";

/// Longest accepted session id, in bytes.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Identifies one logical messaging session (one device pairing).
///
/// Session ids end up in local file names (`<id>.zip`, `session-<id>`), so
/// only ASCII alphanumerics, `-` and `_` are accepted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Validate and wrap a session id.
    pub fn parse(value: impl Into<String>) -> Result<Self, CoreError> {
        let value = value.into();
        if value.is_empty() {
            return Err(CoreError::InvalidSessionId("session id is empty".to_owned()));
        }
        if value.len() > MAX_SESSION_ID_LEN {
            return Err(CoreError::InvalidSessionId(format!(
                "session id exceeds {MAX_SESSION_ID_LEN} bytes"
            )));
        }
        if let Some(c) = value
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(CoreError::InvalidSessionId(format!(
                "invalid character {c:?} in session id {value:?}"
            )));
        }
        Ok(Self(value))
    }

    /// The session id used when none is configured.
    #[must_use]
    pub fn default_id() -> Self {
        Self(DEFAULT_SESSION_ID.to_owned())
    }

    /// Return the inner string as a str slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name of the local archive for this session (`<id>.zip`).
    #[must_use]
    pub fn archive_file_name(&self) -> String {
        format!("{}.zip", self.0)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::default_id()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl TryFrom<&str> for SessionId {
    type Error = CoreError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl std::str::FromStr for SessionId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Opaque reference to an archive in the large-object store.
///
/// Freshly generated references are `UUIDv7` strings, so they sort by
/// creation time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArchiveRef(String);

impl ArchiveRef {
    /// Wrap an existing reference string.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generate a new, time-ordered reference.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    /// Return the inner string as a str slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArchiveRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ArchiveRef {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ArchiveRef {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl AsRef<str> for ArchiveRef {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
