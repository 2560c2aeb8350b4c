use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::error;

use chatroom_gateway::broker::Sender;
use chatroom_types::api::{MessagePage, SendMessageRequest};
use chatroom_types::models::{Message, MessageId, RoomId};

use crate::auth::AppState;
use crate::error::ApiError;
use crate::extract::{ApiJson, ApiPath, ApiQuery};
use crate::middleware::AuthSession;

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 200;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Cursor: only messages with a smaller id are returned.
    pub before: Option<MessageId>,
}

fn default_limit() -> u32 {
    DEFAULT_PAGE_SIZE
}

pub async fn get_messages(
    State(state): State<AppState>,
    ApiPath(room_id): ApiPath<RoomId>,
    ApiQuery(query): ApiQuery<MessageQuery>,
) -> Result<Json<MessagePage>, ApiError> {
    if query.limit == 0 {
        return Err(ApiError::BadRequest("limit must be at least 1".into()));
    }
    let limit = query.limit.min(MAX_PAGE_SIZE);

    // Run blocking DB reads off the async runtime
    let db = state.db.clone();
    let before = query.before;
    let rows = tokio::task::spawn_blocking(move || -> anyhow::Result<Option<_>> {
        if db.get_room(room_id)?.is_none() {
            return Ok(None);
        }
        db.get_messages(room_id, limit, before).map(Some)
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        ApiError::internal(e)
    })?
    .map_err(ApiError::internal)?
    .ok_or_else(|| ApiError::not_found(format!("room {room_id}")))?;

    let messages: Vec<Message> = rows.into_iter().map(Message::from).collect();

    // A full page may have older messages behind it
    let next_before = if messages.len() == limit as usize {
        messages.first().map(|m| m.id)
    } else {
        None
    };

    Ok(Json(MessagePage { messages, next_before }))
}

/// Post through the broker so HTTP and gateway senders share one ordering.
pub async fn send_message(
    State(state): State<AppState>,
    ApiPath(room_id): ApiPath<RoomId>,
    Extension(session): Extension<AuthSession>,
    ApiJson(req): ApiJson<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let sender = Sender {
        user_id: session.user_id,
        session_id: session.session_id,
    };
    let message = state.broker.publish(&sender, room_id, &req.body).await?;
    Ok((StatusCode::CREATED, Json(message)))
}
