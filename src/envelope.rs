//! Envelope — the typed message unit exchanged over a board connection.
//!
//! ARCHITECTURE
//! ============
//! Every piece of realtime traffic is an `Envelope`. Clients send inbound
//! envelopes over the websocket, the dispatcher routes them by `type`, and
//! results flow back either as a reply to the sender or as a broadcast to
//! the board's other subscribers.
//!
//! DESIGN
//! ======
//! - Wire shape is fixed: `{type, board_id, user_id, timestamp, data}`.
//! - `data` is a flat key/value map whose shape is keyed by `type`.
//! - The server stamps `user_id` and `timestamp` on inbound envelopes; values
//!   supplied by the client are never trusted.
//! - `error` and `htmx_update` are server-only types and are rejected inbound.

use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// FIELD CONSTANTS
// =============================================================================

/// Data key for error messages.
pub const FIELD_MESSAGE: &str = "message";

/// Data key for grepable error codes.
pub const FIELD_CODE: &str = "code";

/// Data key for the retryable flag on error envelopes.
pub const FIELD_RETRYABLE: &str = "retryable";

/// Data key naming the inbound type an error responds to.
pub const FIELD_REQUEST_TYPE: &str = "request_type";

/// Data key carrying authoritative state on conflict errors.
pub const FIELD_CURRENT: &str = "current";

// =============================================================================
// TYPES
// =============================================================================

/// Flat key-value payload. Alias to reduce noise in signatures.
pub type Data = HashMap<String, serde_json::Value>;

/// Envelope discriminator. Serialized as `snake_case` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    TaskMove,
    TaskCreate,
    TaskUpdate,
    TaskDelete,
    UserPresence,
    CursorMove,
    Typing,
    Error,
    BoardSnapshot,
    HtmxUpdate,
}

impl EnvelopeType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TaskMove => "task_move",
            Self::TaskCreate => "task_create",
            Self::TaskUpdate => "task_update",
            Self::TaskDelete => "task_delete",
            Self::UserPresence => "user_presence",
            Self::CursorMove => "cursor_move",
            Self::Typing => "typing",
            Self::Error => "error",
            Self::BoardSnapshot => "board_snapshot",
            Self::HtmxUpdate => "htmx_update",
        }
    }

    /// Types that mutate the Task Store and go through the board sequencer.
    #[must_use]
    pub fn is_task_mutation(self) -> bool {
        matches!(self, Self::TaskMove | Self::TaskCreate | Self::TaskUpdate | Self::TaskDelete)
    }

    /// Ephemeral types handled by the presence tracker.
    #[must_use]
    pub fn is_presence(self) -> bool {
        matches!(self, Self::UserPresence | Self::CursorMove | Self::Typing)
    }

    /// Types a client is allowed to send.
    #[must_use]
    pub fn is_inbound(self) -> bool {
        !matches!(self, Self::Error | Self::HtmxUpdate)
    }
}

impl fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content swap strategy carried by `htmx_update` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapStrategy {
    #[serde(rename = "replace")]
    Replace,
    #[serde(rename = "beforeend")]
    InsertAtEnd,
    #[serde(rename = "afterbegin")]
    InsertAtStart,
}

/// The universal message type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    pub board_id: Uuid,
    #[serde(default)]
    pub user_id: Option<Uuid>,
    /// Milliseconds since Unix epoch. Set automatically at construction.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub data: Data,
}

// =============================================================================
// ERRORS
// =============================================================================

/// Grepable error code and retryable flag for structured error envelopes.
pub trait ErrorCode: fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }

    /// Authoritative state the sender should resync to, if any.
    fn current_state(&self) -> Option<serde_json::Value> {
        None
    }
}

/// Inbound envelope rejected before it reaches a handler.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("invalid envelope: {0}")]
    Malformed(String),
    #[error("{kind} envelopes cannot be sent by clients")]
    ServerOnly { kind: EnvelopeType },
    #[error("envelope targets board {got} but connection joined {joined}")]
    BoardMismatch { joined: Uuid, got: Uuid },
    #[error("{kind} requires field `{field}`")]
    MissingField { kind: EnvelopeType, field: &'static str },
    #[error("{kind} field `{field}` is invalid")]
    InvalidField { kind: EnvelopeType, field: &'static str },
}

impl ErrorCode for EnvelopeError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::BoardMismatch { .. } => "E_BOARD_MISMATCH",
            Self::Malformed(_) | Self::ServerOnly { .. } | Self::MissingField { .. } | Self::InvalidField { .. } => {
                "E_VALIDATION"
            }
        }
    }
}

// =============================================================================
// CONSTRUCTORS
// =============================================================================

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

impl Envelope {
    /// Create a server-originated envelope for a board.
    #[must_use]
    pub fn new(kind: EnvelopeType, board_id: Uuid, data: Data) -> Self {
        Self { kind, board_id, user_id: None, timestamp: now_ms(), data }
    }

    /// Create an `htmx_update` envelope carrying a pre-rendered fragment.
    #[must_use]
    pub fn htmx_update(board_id: Uuid, target: impl Into<String>, html: impl Into<String>, swap: SwapStrategy) -> Self {
        Self::new(EnvelopeType::HtmxUpdate, board_id, Data::new())
            .with_data("target", target.into())
            .with_data("html", html.into())
            .with_data("swap", serde_json::to_value(swap).unwrap_or_default())
    }

    /// Create an error envelope answering a request of `request_type`.
    #[must_use]
    pub fn error_for(board_id: Uuid, request_type: Option<EnvelopeType>, err: &(impl ErrorCode + ?Sized)) -> Self {
        let mut data = Data::new();
        data.insert(FIELD_CODE.into(), serde_json::Value::String(err.error_code().to_string()));
        data.insert(FIELD_MESSAGE.into(), serde_json::Value::String(err.to_string()));
        data.insert(FIELD_RETRYABLE.into(), serde_json::Value::Bool(err.retryable()));
        if let Some(kind) = request_type {
            data.insert(FIELD_REQUEST_TYPE.into(), serde_json::Value::String(kind.as_str().to_string()));
        }
        if let Some(current) = err.current_state() {
            data.insert(FIELD_CURRENT.into(), current);
        }
        Self::new(EnvelopeType::Error, board_id, data)
    }

    /// Structured error reply to this envelope. Goes to the sender only.
    #[must_use]
    pub fn error_from(&self, err: &(impl ErrorCode + ?Sized)) -> Self {
        let mut reply = Self::error_for(self.board_id, Some(self.kind), err);
        reply.user_id = self.user_id;
        reply
    }

    /// Parse and validate an inbound text frame from a connection joined to
    /// `joined_board`. Stamps the authenticated user and the receive time.
    ///
    /// # Errors
    ///
    /// Returns `Malformed` for unparsable JSON, `ServerOnly` for types clients
    /// may not send, and `BoardMismatch` when the envelope names another board.
    pub fn parse_inbound(text: &str, joined_board: Uuid, user_id: Uuid) -> Result<Self, EnvelopeError> {
        let mut envelope: Self = serde_json::from_str(text).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        if !envelope.kind.is_inbound() {
            return Err(EnvelopeError::ServerOnly { kind: envelope.kind });
        }
        if envelope.board_id != joined_board {
            return Err(EnvelopeError::BoardMismatch { joined: joined_board, got: envelope.board_id });
        }
        envelope.user_id = Some(user_id);
        envelope.timestamp = now_ms();
        Ok(envelope)
    }
}

// =============================================================================
// BUILDERS
// =============================================================================

impl Envelope {
    #[must_use]
    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

// =============================================================================
// PAYLOAD ACCESS
// =============================================================================

impl Envelope {
    fn missing(&self, field: &'static str) -> EnvelopeError {
        EnvelopeError::MissingField { kind: self.kind, field }
    }

    fn invalid(&self, field: &'static str) -> EnvelopeError {
        EnvelopeError::InvalidField { kind: self.kind, field }
    }

    /// Required UUID field encoded as a string.
    ///
    /// # Errors
    ///
    /// Returns `MissingField` when absent and `InvalidField` when not a UUID.
    pub fn require_uuid(&self, field: &'static str) -> Result<Uuid, EnvelopeError> {
        let value = self.data.get(field).ok_or_else(|| self.missing(field))?;
        value
            .as_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| self.invalid(field))
    }

    /// Optional UUID field. Present-but-invalid is still an error.
    ///
    /// # Errors
    ///
    /// Returns `InvalidField` when present and not a UUID.
    pub fn optional_uuid(&self, field: &'static str) -> Result<Option<Uuid>, EnvelopeError> {
        match self.data.get(field) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(_) => self.require_uuid(field).map(Some),
        }
    }

    /// Required integer field.
    ///
    /// # Errors
    ///
    /// Returns `MissingField` when absent and `InvalidField` when not an integer.
    pub fn require_i64(&self, field: &'static str) -> Result<i64, EnvelopeError> {
        let value = self.data.get(field).ok_or_else(|| self.missing(field))?;
        value.as_i64().ok_or_else(|| self.invalid(field))
    }

    /// Optional integer field.
    ///
    /// # Errors
    ///
    /// Returns `InvalidField` when present and not an integer.
    pub fn optional_i64(&self, field: &'static str) -> Result<Option<i64>, EnvelopeError> {
        match self.data.get(field) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(value) => value.as_i64().map(Some).ok_or_else(|| self.invalid(field)),
        }
    }

    /// Required numeric field.
    ///
    /// # Errors
    ///
    /// Returns `MissingField` when absent and `InvalidField` when not a number.
    pub fn require_f64(&self, field: &'static str) -> Result<f64, EnvelopeError> {
        let value = self.data.get(field).ok_or_else(|| self.missing(field))?;
        value.as_f64().ok_or_else(|| self.invalid(field))
    }

    /// Required non-empty string field.
    ///
    /// # Errors
    ///
    /// Returns `MissingField` when absent or blank, `InvalidField` when not a string.
    pub fn require_str(&self, field: &'static str) -> Result<&str, EnvelopeError> {
        let value = self.data.get(field).ok_or_else(|| self.missing(field))?;
        let s = value.as_str().ok_or_else(|| self.invalid(field))?;
        if s.trim().is_empty() {
            return Err(self.missing(field));
        }
        Ok(s)
    }

    /// Optional string field.
    ///
    /// # Errors
    ///
    /// Returns `InvalidField` when present and not a string.
    pub fn optional_str(&self, field: &'static str) -> Result<Option<&str>, EnvelopeError> {
        match self.data.get(field) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(value) => value.as_str().map(Some).ok_or_else(|| self.invalid(field)),
        }
    }

    /// Required boolean field.
    ///
    /// # Errors
    ///
    /// Returns `MissingField` when absent and `InvalidField` when not a bool.
    pub fn require_bool(&self, field: &'static str) -> Result<bool, EnvelopeError> {
        let value = self.data.get(field).ok_or_else(|| self.missing(field))?;
        value.as_bool().ok_or_else(|| self.invalid(field))
    }
}

#[cfg(test)]
#[path = "envelope_test.rs"]
mod tests;
