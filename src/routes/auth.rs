//! Session authentication for HTTP and websocket routes.
//!
//! The session token comes from the `session_token` cookie, or from an
//! `Authorization: Bearer` header for non-browser clients such as
//! `board-watch`.

use axum::extract::FromRef;
use axum::http::{HeaderMap, StatusCode, header};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use tracing::error;
use uuid::Uuid;

use crate::state::AppState;
use crate::store::SessionUser;

pub(crate) const COOKIE_NAME: &str = "session_token";

// =============================================================================
// AUTH EXTRACTOR
// =============================================================================

/// Authenticated user extracted from the session token.
/// Use as a handler parameter to require authentication.
pub struct AuthUser {
    pub user: SessionUser,
}

impl<S> axum::extract::FromRequestParts<S> for AuthUser
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut axum::http::request::Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = session_token(&parts.headers).ok_or(StatusCode::UNAUTHORIZED)?;

        let app_state = AppState::from_ref(state);
        let user = app_state
            .access
            .session_user(&token)
            .await
            .map_err(|e| {
                error!(error = %e, "auth: session lookup failed");
                StatusCode::SERVICE_UNAVAILABLE
            })?
            .ok_or(StatusCode::UNAUTHORIZED)?;

        Ok(Self { user })
    }
}

/// Session token from the cookie, falling back to a bearer header.
pub(crate) fn session_token(headers: &HeaderMap) -> Option<String> {
    let jar = CookieJar::from_headers(headers);
    if let Some(token) = jar.get(COOKIE_NAME).map(Cookie::value)
        && !token.is_empty()
    {
        return Some(token.to_owned());
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
}

/// Reject with 403 unless `user_id` may access `board_id`.
pub(crate) async fn require_board_access(state: &AppState, user_id: Uuid, board_id: Uuid) -> Result<(), StatusCode> {
    match state.access.has_board_access(user_id, board_id).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(StatusCode::FORBIDDEN),
        Err(e) => {
            error!(%board_id, %user_id, error = %e, "auth: board access check failed");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

#[cfg(test)]
#[path = "auth_test.rs"]
mod tests;
