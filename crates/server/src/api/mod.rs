pub mod health;
pub mod sessions;
pub mod status;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

use crate::lifecycle::SessionManager;
use crate::store_factory::StoreBackend;

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    /// The managed messaging session.
    pub manager: Arc<SessionManager>,
    /// Store backend, for connectivity checks and inspection.
    pub backend: Arc<StoreBackend>,
    /// Path to the built frontend.
    pub ui_path: Option<String>,
    /// Whether the frontend is served.
    pub ui_enabled: bool,
}

/// Build the Axum router with all API routes and the frontend fallback.
pub fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(health::health))
        .route("/api/status", get(status::status))
        .route("/api/qrcode", get(status::qr_code))
        .route("/api/init", post(status::init))
        .route("/api/status/client", get(status::client_status))
        .route("/api/logout", post(status::logout))
        .route("/api/sessions", get(sessions::list_sessions))
        .route("/api/sessions/{id}", get(sessions::get_session));

    if let Some(path_str) = state.ui_path.as_ref().filter(|_| state.ui_enabled) {
        let path = std::path::PathBuf::from(path_str);
        if path.exists() {
            let index_path = path.join("index.html");
            router = router.fallback_service(ServeDir::new(path).fallback(ServeFile::new(index_path)));
        } else {
            tracing::warn!(
                path = %path.display(),
                "frontend directory not found, UI will not be served"
            );
        }
    }

    router
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
