use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::archive::ArchiveError;
use crate::driver::DriverError;

/// Errors that can occur when running the Tether server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// A configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// An I/O error (e.g. binding the listener).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The session store could not be reached or set up.
    #[error("store error: {0}")]
    Store(String),

    /// A session store operation failed.
    #[error("persist error: {0}")]
    Persist(#[from] tether_store::PersistError),

    /// The external messaging client failed.
    #[error("client error: {0}")]
    Driver(#[from] DriverError),

    /// Packing or unpacking the local profile failed.
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),

    /// The request was malformed or not allowed in the current state.
    #[error("{0}")]
    BadRequest(String),

    /// The requested resource does not exist.
    #[error("{0}")]
    NotFound(String),

    /// A failure reported to API callers with a fixed message.
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Persist(e) if e.is_expected() => StatusCode::NOT_FOUND,
            Self::Driver(DriverError::AlreadyRunning) => StatusCode::CONFLICT,
            Self::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Config(_)
            | Self::Io(_)
            | Self::Persist(_)
            | Self::Driver(_)
            | Self::Archive(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tether_core::SessionId;
    use tether_store::PersistError;

    #[test]
    fn status_codes() {
        let cases = [
            (ServerError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (ServerError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (
                ServerError::Persist(PersistError::NotFound(SessionId::default_id())),
                StatusCode::NOT_FOUND,
            ),
            (
                ServerError::Persist(PersistError::WriteFailure("x".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (ServerError::Store("down".into()), StatusCode::SERVICE_UNAVAILABLE),
            (ServerError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }

    #[tokio::test]
    async fn body_carries_message() {
        let response = ServerError::BadRequest("Already connecting".into()).into_response();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "Already connecting");
    }
}
