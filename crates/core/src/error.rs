use thiserror::Error;

use crate::status::{ClientSignal, ClientStatus};

/// Errors raised by core type validation and the client state machine.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("transition {signal:?} not allowed from {from}")]
    InvalidTransition {
        from: ClientStatus,
        signal: ClientSignal,
    },
}
