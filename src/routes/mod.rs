//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! One Axum router carries the per-board websocket upgrade, the REST
//! resync endpoints and the health probe. Every board route authenticates
//! through the `AuthUser` extractor and then checks board access.

pub mod auth;
pub mod boards;
pub mod ws;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Full application router.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws/{board_id}", get(ws::handle_ws))
        .route("/api/boards/{board_id}/snapshot", get(boards::snapshot))
        .route("/api/boards/{board_id}/presence", get(boards::presence))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}
