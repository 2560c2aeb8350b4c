use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use tracing::info;
use validator::Validate;

use chatroom_db::is_constraint_violation;
use chatroom_types::api::CreateRoomRequest;
use chatroom_types::models::Room;

use crate::auth::AppState;
use crate::error::ApiError;
use crate::extract::ApiJson;
use crate::middleware::AuthSession;

pub async fn list_rooms(State(state): State<AppState>) -> Result<Json<Vec<Room>>, ApiError> {
    let rooms = state.db.list_rooms().map_err(ApiError::internal)?;
    Ok(Json(rooms.into_iter().map(Room::from).collect()))
}

pub async fn create_room(
    State(state): State<AppState>,
    Extension(session): Extension<AuthSession>,
    ApiJson(req): ApiJson<CreateRoomRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let req = req.normalized();
    req.validate()?;
    let name = req.name.as_str();

    let room = state.db.create_room(name).map_err(|e| {
        if is_constraint_violation(&e) {
            ApiError::Conflict(format!("room '{name}' already exists"))
        } else {
            ApiError::internal(e)
        }
    })?;

    info!("{} created room {} ({})", session.username, room.name, room.id);
    Ok((StatusCode::CREATED, Json(Room::from(room))))
}
