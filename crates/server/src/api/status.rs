//! Client status, pairing code, start and logout.
//!
//! Response bodies keep the camelCase keys and status names the bundled
//! frontend reads.

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use tether_core::{ClientInfo, ClientStatus};

use super::AppState;
use crate::error::ServerError;
use crate::lifecycle::{FailureKind, InitOutcome, SessionSnapshot};

/// Status name as shown to the frontend.
pub fn wire_status(snapshot: &SessionSnapshot) -> &'static str {
    match snapshot.status {
        ClientStatus::Uninitialized => "not_initialized",
        ClientStatus::Initializing => "initializing",
        ClientStatus::Pairing => "qr_received",
        ClientStatus::Authenticated => "authenticated",
        ClientStatus::Ready => "ready",
        ClientStatus::Disconnected => "disconnected",
        ClientStatus::Failed => match snapshot.failure {
            Some(FailureKind::AuthRejected) => "auth_failed",
            Some(FailureKind::Error) | None => "error",
        },
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: &'static str,
    pub is_connecting: bool,
    pub has_qr_code: bool,
    pub client_exists: bool,
    pub store_connected: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QrCodeResponse {
    pub qr_code: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<&'static str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStatusResponse {
    pub status: &'static str,
    /// Only set while a pairing code is waiting to be scanned.
    pub qr_code: Option<String>,
    pub initializing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_phone_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_info: Option<ClientInfo>,
}

/// `GET /api/status`
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let snapshot = state.manager.snapshot();
    Json(StatusResponse {
        status: wire_status(&snapshot),
        is_connecting: snapshot.status.is_connecting(),
        has_qr_code: snapshot.qr_code.is_some(),
        client_exists: state.manager.client_exists().await,
        store_connected: state.backend.is_connected().await,
    })
}

/// `GET /api/qrcode`
pub async fn qr_code(State(state): State<AppState>) -> Result<Json<QrCodeResponse>, ServerError> {
    state
        .manager
        .snapshot()
        .qr_code
        .map(|qr_code| Json(QrCodeResponse { qr_code }))
        .ok_or_else(|| ServerError::NotFound("No QR code available".into()))
}

/// `POST /api/init`
///
/// Returns as soon as the start is scheduled; progress shows up in the
/// status endpoints.
pub async fn init(State(state): State<AppState>) -> Result<Json<MessageResponse>, ServerError> {
    let outcome = state.manager.spawn_initialize().map_err(|e| match e {
        ServerError::BadRequest(_) => e,
        other => {
            tracing::error!(error = %other, "failed to start client initialization");
            ServerError::Internal("Failed to initialize client".into())
        }
    })?;

    let message = match outcome {
        InitOutcome::Started => "Initialization started",
        InitOutcome::AlreadyReady => "Client already connected",
    };
    Ok(Json(MessageResponse {
        message,
        status: Some(wire_status(&state.manager.snapshot())),
    }))
}

/// `GET /api/status/client`
pub async fn client_status(State(state): State<AppState>) -> Json<ClientStatusResponse> {
    let snapshot = state.manager.snapshot();
    let status = wire_status(&snapshot);

    let info = snapshot
        .info
        .clone()
        .filter(|_| snapshot.status == ClientStatus::Ready);

    Json(ClientStatusResponse {
        status,
        qr_code: snapshot
            .qr_code
            .clone()
            .filter(|_| snapshot.status == ClientStatus::Pairing),
        initializing: snapshot.status.is_connecting(),
        user_phone_number: info.as_ref().map(|i| i.user().to_owned()),
        client_info: info,
    })
}

/// `POST /api/logout`
pub async fn logout(State(state): State<AppState>) -> Result<Json<MessageResponse>, ServerError> {
    if state.manager.logout().await {
        Ok(Json(MessageResponse {
            message: "Logged out successfully and session deleted",
            status: None,
        }))
    } else {
        Err(ServerError::Internal("Failed to logout".into()))
    }
}
