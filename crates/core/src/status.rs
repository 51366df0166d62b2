//! Lifecycle state machine for the messaging client.
//!
//! The external client reports what happens to it (pairing code issued,
//! authenticated, disconnected, ...) as [`ClientSignal`]s. Applying a signal
//! to the current [`ClientStatus`] either yields the next status or is
//! rejected as an invalid transition, which callers log and ignore.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Where the messaging client currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    /// No client has been started, or the last one logged out.
    #[default]
    Uninitialized,
    /// The client process is starting and may be restoring a session.
    Initializing,
    /// A pairing code was issued and is waiting to be scanned.
    Pairing,
    /// The device pairing succeeded; the client is still loading.
    Authenticated,
    /// The client is fully connected and serving.
    Ready,
    /// The client dropped its connection.
    Disconnected,
    /// Authentication or initialization failed.
    Failed,
}

impl ClientStatus {
    /// Return the wire name of the status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Pairing => "pairing",
            Self::Authenticated => "authenticated",
            Self::Ready => "ready",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
        }
    }

    /// Whether the client holds valid credentials worth backing up.
    #[must_use]
    pub fn is_authenticated(self) -> bool {
        matches!(self, Self::Authenticated | Self::Ready)
    }

    /// Whether a client start is in flight.
    #[must_use]
    pub fn is_connecting(self) -> bool {
        matches!(self, Self::Initializing | Self::Pairing | Self::Authenticated)
    }

    /// Whether a new client may be started from this status.
    #[must_use]
    pub fn can_initialize(self) -> bool {
        matches!(self, Self::Uninitialized | Self::Disconnected | Self::Failed)
    }

    /// Compute the status reached by applying `signal`.
    pub fn apply(self, signal: ClientSignal) -> Result<Self, CoreError> {
        use ClientSignal as S;
        use ClientStatus as C;

        let next = match (self, signal) {
            (_, S::Reset) => Some(C::Uninitialized),
            (_, S::Errored) => Some(C::Failed),
            (from, S::Initialize) if from.can_initialize() => Some(C::Initializing),
            (C::Initializing | C::Pairing, S::PairingCodeIssued) => Some(C::Pairing),
            (C::Initializing | C::Pairing, S::Authenticated) => Some(C::Authenticated),
            (C::Initializing | C::Authenticated, S::Ready) => Some(C::Ready),
            (C::Initializing | C::Pairing | C::Authenticated, S::AuthFailed) => Some(C::Failed),
            (C::Initializing | C::Pairing | C::Authenticated | C::Ready, S::Disconnected) => {
                Some(C::Disconnected)
            }
            _ => None,
        };

        next.ok_or(CoreError::InvalidTransition { from: self, signal })
    }
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that happened to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientSignal {
    /// A client start was requested.
    Initialize,
    /// The client issued a pairing (QR) code.
    PairingCodeIssued,
    /// The pairing or restored session was accepted.
    Authenticated,
    /// The client finished loading.
    Ready,
    /// The remote side rejected the credentials.
    AuthFailed,
    /// The connection dropped.
    Disconnected,
    /// Starting the client failed locally.
    Errored,
    /// The session was logged out and torn down.
    Reset,
}

/// Profile of the account the client is logged in as.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    /// Display name of the account.
    #[serde(default)]
    pub pushname: Option<String>,
    /// Serialized account id (`<number>@<server>`).
    pub wid: String,
    /// Platform reported by the paired device.
    #[serde(default)]
    pub platform: Option<String>,
    /// Profile picture URL, when one is available.
    #[serde(default)]
    pub profile_pic_url: Option<String>,
}

impl ClientInfo {
    /// The user part of the account id (the phone number).
    #[must_use]
    pub fn user(&self) -> &str {
        self.wid.split('@').next().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairing_flow() {
        let s = ClientStatus::Uninitialized;
        let s = s.apply(ClientSignal::Initialize).unwrap();
        assert_eq!(s, ClientStatus::Initializing);
        let s = s.apply(ClientSignal::PairingCodeIssued).unwrap();
        assert_eq!(s, ClientStatus::Pairing);
        // A refreshed QR code keeps the client in pairing.
        let s = s.apply(ClientSignal::PairingCodeIssued).unwrap();
        assert_eq!(s, ClientStatus::Pairing);
        let s = s.apply(ClientSignal::Authenticated).unwrap();
        assert_eq!(s, ClientStatus::Authenticated);
        let s = s.apply(ClientSignal::Ready).unwrap();
        assert_eq!(s, ClientStatus::Ready);
        assert!(s.is_authenticated());
        assert!(!s.is_connecting());
    }

    #[test]
    fn restored_session_can_go_straight_to_ready() {
        let s = ClientStatus::Initializing
            .apply(ClientSignal::Ready)
            .unwrap();
        assert_eq!(s, ClientStatus::Ready);
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        assert!(ClientStatus::Uninitialized.apply(ClientSignal::Ready).is_err());
        assert!(ClientStatus::Ready.apply(ClientSignal::Initialize).is_err());
        assert!(
            ClientStatus::Ready
                .apply(ClientSignal::PairingCodeIssued)
                .is_err()
        );
        assert!(
            ClientStatus::Uninitialized
                .apply(ClientSignal::Disconnected)
                .is_err()
        );
    }

    #[test]
    fn reset_and_error_apply_from_anywhere() {
        for s in [
            ClientStatus::Uninitialized,
            ClientStatus::Pairing,
            ClientStatus::Ready,
            ClientStatus::Failed,
        ] {
            assert_eq!(
                s.apply(ClientSignal::Reset).unwrap(),
                ClientStatus::Uninitialized
            );
            assert_eq!(s.apply(ClientSignal::Errored).unwrap(), ClientStatus::Failed);
        }
    }

    #[test]
    fn restart_after_disconnect_or_failure() {
        assert!(ClientStatus::Disconnected.can_initialize());
        assert!(ClientStatus::Failed.can_initialize());
        assert_eq!(
            ClientStatus::Failed.apply(ClientSignal::Initialize).unwrap(),
            ClientStatus::Initializing
        );
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&ClientStatus::Uninitialized).unwrap();
        assert_eq!(json, "\"uninitialized\"");
        assert_eq!(ClientStatus::Pairing.to_string(), "pairing");
    }

    #[test]
    fn client_info_user_is_number() {
        let info = ClientInfo {
            wid: "15551234567@c.us".into(),
            ..ClientInfo::default()
        };
        assert_eq!(info.user(), "15551234567");
    }

    #[test]
    fn client_info_uses_camel_case() {
        let info: ClientInfo = serde_json::from_str(
            r#"{"pushname":"Ada","wid":"1555@c.us","profilePicUrl":"https://pic"}"#,
        )
        .unwrap();
        assert_eq!(info.profile_pic_url.as_deref(), Some("https://pic"));
        assert!(info.platform.is_none());
    }
}
