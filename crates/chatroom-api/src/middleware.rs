use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Bearer};
use chrono::Utc;
use tracing::debug;

use chatroom_types::models::UserId;

use crate::auth::{AppState, AppStateInner, decode_token};
use crate::error::ApiError;

/// The caller behind a validated bearer token.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub user_id: UserId,
    pub username: String,
    pub session_id: String,
}

/// Reject requests without a live session; otherwise attach [`AuthSession`].
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let bearer = req
        .headers()
        .typed_get::<Authorization<Bearer>>()
        .ok_or(ApiError::Unauthorized)?;

    let session = authenticate(&state, bearer.token())?;
    req.extensions_mut().insert(session);
    Ok(next.run(req).await)
}

/// Resolve a token to its session. The token must verify, its session row
/// must still exist and be unexpired, and the user must still exist.
pub fn authenticate(state: &AppStateInner, token: &str) -> Result<AuthSession, ApiError> {
    let claims = decode_token(&state.jwt_secret, token).map_err(|e| {
        debug!("Rejected token: {}", e);
        ApiError::Unauthorized
    })?;

    let session = state
        .db
        .get_active_session(&claims.sid, Utc::now())
        .map_err(ApiError::internal)?
        .ok_or(ApiError::Unauthorized)?;
    if session.user_id != claims.sub {
        return Err(ApiError::Unauthorized);
    }

    // Username may have changed since the token was issued
    let user = state
        .db
        .get_user_by_id(claims.sub)
        .map_err(ApiError::internal)?
        .ok_or(ApiError::Unauthorized)?;

    Ok(AuthSession {
        user_id: user.id,
        username: user.username,
        session_id: session.id,
    })
}
