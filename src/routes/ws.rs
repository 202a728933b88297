//! WebSocket handler — per-connection envelope relay.
//!
//! DESIGN
//! ======
//! After auth and the board access check, the upgrade registers a
//! `Connection` and enters a `select!` loop:
//! - inbound text frames → `dispatch::dispatch_text`
//! - queued envelopes from the board (broadcasts, acks, errors) → socket
//! - registry eviction → close
//! - heartbeat tick → ping, or close when the peer has gone quiet
//!
//! Every write is bounded by `write_timeout`. A failed or slow write is a
//! transport error: it ends this connection only.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → `join_board` (online presence + `board_snapshot`)
//! 2. Client sends envelopes → dispatch → replies arrive via the queue
//! 3. Close, transport error, idle timeout or eviction → `leave_board`

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::envelope::{Envelope, EnvelopeType, FIELD_CODE, now_ms};
use crate::routes::auth::{AuthUser, require_board_access};
use crate::services::dispatch::{self, Outcome};
use crate::services::registry::{Connection, outbound_channel};
use crate::state::AppState;
use crate::store::SessionUser;

#[derive(Debug, thiserror::Error)]
enum TransportError {
    #[error("serialize envelope: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("socket write: {0}")]
    Socket(#[from] axum::Error),
    #[error("socket write timed out")]
    Timeout,
}

// =============================================================================
// UPGRADE
// =============================================================================

/// `GET /ws/{board_id}` — upgrade to the board's realtime channel.
pub async fn handle_ws(
    State(state): State<AppState>,
    Path(board_id): Path<Uuid>,
    auth: AuthUser,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(status) = require_board_access(&state, auth.user.id, board_id).await {
        let message = if status == StatusCode::FORBIDDEN { "no access to board" } else { "access check failed" };
        return (status, message).into_response();
    }

    ws.on_upgrade(move |socket| run_ws(socket, state, board_id, auth.user))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, board_id: Uuid, user: SessionUser) {
    let connection = Arc::new(Connection::new(board_id, user.id, user.name));
    let (outbound, mut inbound) = outbound_channel(state.config.outbound_buffer);
    let write_timeout = state.config.write_timeout;
    let heartbeat_timeout_ms = i64::try_from(state.config.heartbeat_timeout.as_millis()).unwrap_or(i64::MAX);

    info!(%board_id, connection_id = %connection.id, user_id = %connection.user_id, "ws: client connected");
    dispatch::join_board(&state, connection.clone(), outbound).await;

    let period = state.config.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break "transport closed" };
                match msg {
                    Message::Text(text) => {
                        if let Outcome::Detached = dispatch::dispatch_text(&state, &connection, text.as_str()).await {
                            break "detached";
                        }
                    }
                    Message::Close(_) => break "client closed",
                    Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {
                        dispatch::refresh_activity(&state, &connection).await;
                    }
                }
            }
            queued = inbound.rx.recv() => {
                let Some(envelope) = queued else { break "queue closed" };
                if let Err(e) = send_envelope(&mut socket, &envelope, write_timeout).await {
                    warn!(connection_id = %connection.id, error = %e, "ws: write failed");
                    break "write failed";
                }
            }
            () = inbound.evicted.notified() => {
                close(&mut socket, close_code::POLICY, "evicted", write_timeout).await;
                break "evicted";
            }
            _ = heartbeat.tick() => {
                if now_ms() - connection.last_activity_ms() > heartbeat_timeout_ms {
                    close(&mut socket, close_code::AWAY, "heartbeat timeout", write_timeout).await;
                    break "heartbeat timeout";
                }
                if let Err(e) = write_message(&mut socket, Message::Ping(Bytes::new()), write_timeout).await {
                    warn!(connection_id = %connection.id, error = %e, "ws: ping failed");
                    break "ping failed";
                }
            }
        }
    };

    dispatch::leave_board(&state, &connection).await;
    info!(%board_id, connection_id = %connection.id, reason, "ws: client disconnected");
}

// =============================================================================
// WRITES
// =============================================================================

async fn send_envelope(socket: &mut WebSocket, envelope: &Envelope, write_timeout: Duration) -> Result<(), TransportError> {
    let json = serde_json::to_string(envelope)?;
    match envelope.kind {
        EnvelopeType::CursorMove | EnvelopeType::Typing => {}
        EnvelopeType::Error => {
            let code = envelope.data.get(FIELD_CODE).and_then(|v| v.as_str()).unwrap_or("-");
            debug!(board_id = %envelope.board_id, code, "ws: send error envelope");
        }
        kind => debug!(board_id = %envelope.board_id, kind = kind.as_str(), "ws: send envelope"),
    }
    write_message(socket, Message::Text(json.into()), write_timeout).await
}

async fn write_message(socket: &mut WebSocket, message: Message, write_timeout: Duration) -> Result<(), TransportError> {
    match tokio::time::timeout(write_timeout, socket.send(message)).await {
        Ok(result) => result.map_err(TransportError::from),
        Err(_) => Err(TransportError::Timeout),
    }
}

async fn close(socket: &mut WebSocket, code: u16, reason: &'static str, write_timeout: Duration) {
    let frame = CloseFrame { code, reason: reason.into() };
    let _ = write_message(socket, Message::Close(Some(frame)), write_timeout).await;
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
