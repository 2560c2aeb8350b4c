use axum::{
    Json,
    extract::{State, WebSocketUpgrade, ws::rejection::WebSocketUpgradeRejection},
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Bearer};
use serde::Deserialize;
use tracing::debug;

use chatroom_gateway::connection::{self, ConnectionIdentity};
use chatroom_types::api::HealthResponse;

use crate::auth::AppState;
use crate::error::ApiError;
use crate::extract::ApiQuery;
use crate::middleware::authenticate;

#[derive(Debug, Deserialize)]
pub struct GatewayQuery {
    /// Browsers cannot set headers on a WebSocket handshake.
    pub token: Option<String>,
}

/// Authenticate, then hand the socket to the delivery core.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<GatewayQuery>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    let token = match headers.typed_get::<Authorization<Bearer>>() {
        Some(bearer) => bearer.token().to_string(),
        None => query.token.ok_or(ApiError::Unauthorized)?,
    };

    // Authenticate before looking at the upgrade headers
    let session = authenticate(&state, &token)?;
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };
    debug!("Gateway upgrade for {} ({})", session.username, session.user_id);

    let identity = ConnectionIdentity {
        user_id: session.user_id,
        username: session.username,
        session_id: session.session_id,
    };
    let broker = state.broker.clone();
    let heartbeat = state.heartbeat_interval;

    Ok(ws.on_upgrade(move |socket| connection::handle_connection(socket, broker, identity, heartbeat)))
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        connections: state.registry.connection_count().await,
        online_users: state.registry.online_users().await.len(),
    })
}
