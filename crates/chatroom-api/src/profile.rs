use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;
use validator::Validate;

use chatroom_types::api::UpdateProfileRequest;
use chatroom_types::models::{PublicUser, User, UserId};

use crate::auth::AppState;
use crate::error::ApiError;
use crate::extract::{ApiJson, ApiPath};
use crate::middleware::AuthSession;

pub async fn get_profile(
    State(state): State<AppState>,
    Extension(session): Extension<AuthSession>,
) -> Result<Json<User>, ApiError> {
    let user = state
        .db
        .get_user_by_id(session.user_id)
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("user"))?;
    Ok(Json(user.into_user()))
}

pub async fn update_profile(
    State(state): State<AppState>,
    Extension(session): Extension<AuthSession>,
    ApiJson(req): ApiJson<UpdateProfileRequest>,
) -> Result<Json<User>, ApiError> {
    // Validate after trimming so "  " counts as cleared, not as a bad URL
    let req = req.normalized();
    req.validate()?;

    let user = state
        .db
        .update_profile(
            session.user_id,
            &req.username,
            req.website.as_deref(),
            req.bio.as_deref(),
        )
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("user"))?;

    info!("{} updated their profile", user.id);
    Ok(Json(user.into_user()))
}

/// Delete the account. Messages and sessions cascade; live connections close.
pub async fn delete_profile(
    State(state): State<AppState>,
    Extension(session): Extension<AuthSession>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state
        .db
        .delete_user(session.user_id)
        .map_err(ApiError::internal)?;
    if !deleted {
        return Err(ApiError::not_found("user"));
    }

    let closed = state.registry.revoke_user(session.user_id).await;
    info!(
        "{} ({}) deleted their account, closed {} connection(s)",
        session.username, session.user_id, closed
    );
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_user(
    State(state): State<AppState>,
    ApiPath(user_id): ApiPath<UserId>,
) -> Result<Json<PublicUser>, ApiError> {
    let user = state
        .db
        .get_user_by_id(user_id)
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("user"))?;
    Ok(Json(user.into_public()))
}
