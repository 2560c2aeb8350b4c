//! Router assembly and shared state construction.

use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use chatroom_api::auth::{self, AppState, AppStateInner};
use chatroom_api::error;
use chatroom_api::middleware::require_auth;
use chatroom_api::{gateway, messages, profile, rooms};
use chatroom_db::Database;

use crate::config::{DatabaseLocation, Profile, ServerConfig};

pub fn open_database(location: &DatabaseLocation) -> anyhow::Result<Database> {
    match location {
        DatabaseLocation::File(path) => Database::open(path),
        DatabaseLocation::Memory => Database::open_in_memory(),
    }
}

/// Open the database and wire up the registry and broker.
pub fn build_state(config: &ServerConfig) -> anyhow::Result<AppState> {
    if config.profile == Profile::Production && config.uses_default_secret() {
        warn!("SECRET_KEY is not set; tokens are signed with the built-in default");
    }

    let db = Arc::new(open_database(&config.database)?);
    Ok(Arc::new(AppStateInner::new(
        db,
        config.secret_key.clone(),
        config.delivery_capacity,
    )))
}

pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(gateway::health))
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/gateway", get(gateway::ws_upgrade));

    let protected_routes = Router::new()
        .route("/auth/logout", get(auth::logout).post(auth::logout))
        .route(
            "/profile",
            get(profile::get_profile)
                .put(profile::update_profile)
                .delete(profile::delete_profile),
        )
        .route("/users/{user_id}", get(profile::get_user))
        .route("/rooms", get(rooms::list_rooms).post(rooms::create_room))
        .route(
            "/rooms/{room_id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .fallback(error::not_found)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
