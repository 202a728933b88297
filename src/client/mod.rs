//! Realtime client support shared by `board-watch` and other Rust clients.

pub mod reconnect;

use uuid::Uuid;

use crate::envelope::{Data, Envelope, EnvelopeType};
use crate::services::presence::STATUS_ONLINE;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("missing session token; pass --session-token or set KANBAN_SESSION_TOKEN")]
    MissingSessionToken,
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue),
    #[error("websocket error: {0}")]
    Ws(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("cannot {event} while {from}")]
    InvalidTransition { from: &'static str, event: &'static str },
    #[error("gave up after {attempts} reconnect attempts")]
    GaveUp { attempts: u32 },
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Ws(Box::new(err))
    }
}

/// Realtime endpoint for `board_id` under an `http(s)://` base URL.
///
/// # Errors
///
/// Returns `InvalidBaseUrl` for any other scheme.
pub fn ws_url(base_url: &str, board_id: Uuid) -> Result<String, ClientError> {
    let base = base_url.trim_end_matches('/');
    if let Some(rest) = base.strip_prefix("http://") {
        return Ok(format!("ws://{rest}/ws/{board_id}"));
    }
    if let Some(rest) = base.strip_prefix("https://") {
        return Ok(format!("wss://{rest}/ws/{board_id}"));
    }

    Err(ClientError::InvalidBaseUrl(base_url.to_owned()))
}

/// The `user_presence` online envelope a client sends right after connecting.
#[must_use]
pub fn online_announcement(board_id: Uuid) -> Envelope {
    Envelope::new(EnvelopeType::UserPresence, board_id, Data::new()).with_data("status", STATUS_ONLINE)
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
