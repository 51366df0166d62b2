//! Read-only inspection of the session store.

use axum::Json;
use axum::extract::{Path, State};

use tether_core::{SessionId, SessionRecord};
use tether_store::Inventory;

use super::AppState;
use crate::error::ServerError;

/// `GET /api/sessions`
pub async fn list_sessions(State(state): State<AppState>) -> Result<Json<Inventory>, ServerError> {
    let inventory = state.manager.store().inventory().await?;
    Ok(Json(inventory))
}

/// `GET /api/sessions/{id}`
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionRecord>, ServerError> {
    let id = SessionId::parse(id).map_err(|e| ServerError::BadRequest(e.to_string()))?;
    state
        .manager
        .store()
        .record(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ServerError::NotFound(format!("no stored session for {id}")))
}
