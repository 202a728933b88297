//! Board read routes for clients resyncing outside the websocket.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::envelope::ErrorCode;
use crate::routes::auth::{AuthUser, require_board_access};
use crate::services::dispatch::{self, BoardSnapshot};
use crate::services::task::TaskError;
use crate::state::AppState;
use crate::store::PresenceRecord;

#[derive(Serialize)]
pub struct PresenceResponse {
    pub board_id: Uuid,
    pub connections: usize,
    pub presence: Vec<PresenceRecord>,
}

/// `GET /api/boards/{board_id}/snapshot` — tasks and presence at one board seq.
pub async fn snapshot(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(board_id): Path<Uuid>,
) -> Result<Json<BoardSnapshot>, StatusCode> {
    require_board_access(&state, auth.user.id, board_id).await?;
    let snapshot = dispatch::board_snapshot(&state, board_id)
        .await
        .map_err(|e| task_error_to_status(board_id, &e))?;
    Ok(Json(snapshot))
}

/// `GET /api/boards/{board_id}/presence` — who is on the board right now.
pub async fn presence(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(board_id): Path<Uuid>,
) -> Result<Json<PresenceResponse>, StatusCode> {
    require_board_access(&state, auth.user.id, board_id).await?;
    Ok(Json(PresenceResponse {
        board_id,
        connections: state.registry.count(board_id).await,
        presence: state.presence.list_by_board(board_id).await,
    }))
}

fn task_error_to_status(board_id: Uuid, err: &TaskError) -> StatusCode {
    match err.error_code() {
        "E_NOT_FOUND" => StatusCode::NOT_FOUND,
        "E_VALIDATION" => StatusCode::BAD_REQUEST,
        code => {
            warn!(%board_id, code, error = %err, "boards: snapshot failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

#[cfg(test)]
#[path = "boards_test.rs"]
mod tests;
