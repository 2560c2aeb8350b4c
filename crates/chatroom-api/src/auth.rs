use std::sync::Arc;

use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::{SaltString, rand_core::OsRng}};
use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

use chatroom_db::{Database, is_constraint_violation, models::UserRow};
use chatroom_gateway::broker::Broker;
use chatroom_gateway::connection::HEARTBEAT_INTERVAL;
use chatroom_gateway::registry::SessionRegistry;
use chatroom_types::api::{AuthResponse, Claims, LoginRequest, RegisterRequest};

use crate::error::ApiError;
use crate::extract::{ApiJson, ValidJson};
use crate::middleware::AuthSession;

/// Session lifetime when "remember me" is set (and after registration).
pub const REMEMBER_SESSION: Duration = Duration::days(30);
/// Session lifetime otherwise.
pub const DEFAULT_SESSION: Duration = Duration::days(1);

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub jwt_secret: String,
    pub registry: SessionRegistry,
    pub broker: Broker,
    /// Gateway Ping period; two unanswered Pings drop the connection.
    pub heartbeat_interval: std::time::Duration,
}

impl AppStateInner {
    pub fn new(db: Arc<Database>, jwt_secret: String, delivery_capacity: usize) -> Self {
        let registry = SessionRegistry::new(delivery_capacity);
        let broker = Broker::new(db.clone(), registry.clone());
        Self {
            db,
            jwt_secret,
            registry,
            broker,
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }
}

pub async fn register(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    // Validate after trimming so a blank username is rejected
    let req = req.normalized();
    req.validate()?;
    let email = &req.email;
    let username = &req.username;

    // Check if email is taken
    if state.db.get_user_by_email(email).map_err(ApiError::internal)?.is_some() {
        return Err(ApiError::DuplicateEmail);
    }

    let password_hash = hash_password(&req.password)?;

    let user = state
        .db
        .create_user(email, username, &password_hash)
        .map_err(|e| {
            // Lost a race with a concurrent registration
            if is_constraint_violation(&e) {
                ApiError::DuplicateEmail
            } else {
                ApiError::internal(e)
            }
        })?;

    info!("Registered {} ({})", user.username, user.id);

    let response = establish_session(&state, user, true)?;
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn login(
    State(state): State<AppState>,
    ValidJson(req): ValidJson<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let email = req.email.trim().to_lowercase();

    let user = state
        .db
        .get_user_by_email(&email)
        .map_err(ApiError::internal)?
        .ok_or(ApiError::InvalidCredentials)?;

    if !verify_password(&user.password_hash, &req.password)? {
        warn!("Failed login for {}", user.id);
        return Err(ApiError::InvalidCredentials);
    }

    match state.db.purge_expired_sessions(Utc::now()) {
        Ok(0) => {}
        Ok(n) => info!("Purged {} expired session(s)", n),
        Err(e) => warn!("Failed to purge expired sessions: {:#}", e),
    }

    info!("{} ({}) logged in", user.username, user.id);
    Ok(Json(establish_session(&state, user, req.remember)?))
}

pub async fn logout(
    State(state): State<AppState>,
    Extension(session): Extension<AuthSession>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .db
        .delete_session(&session.session_id)
        .map_err(ApiError::internal)?;

    let closed = state.registry.revoke_session(&session.session_id).await;
    info!(
        "{} ({}) logged out, closed {} connection(s)",
        session.username, session.user_id, closed
    );

    Ok(StatusCode::NO_CONTENT)
}

/// Argon2id with a random salt; returns the PHC string.
pub fn hash_password(password: &str) -> Result<String, ApiError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ApiError::internal(anyhow::anyhow!("password hashing failed: {e}")))
}

/// Errors only when the stored hash itself is unreadable.
pub fn verify_password(stored_hash: &str, password: &str) -> Result<bool, ApiError> {
    let parsed = PasswordHash::new(stored_hash)
        .map_err(|e| ApiError::internal(anyhow::anyhow!("stored password hash is corrupt: {e}")))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// Create the server-side session row and the token that refers to it.
fn establish_session(state: &AppStateInner, user: UserRow, remember: bool) -> Result<AuthResponse, ApiError> {
    let session_id = Uuid::new_v4().to_string();
    let lifetime = if remember { REMEMBER_SESSION } else { DEFAULT_SESSION };
    let expires_at = Utc::now() + lifetime;

    state
        .db
        .create_session(&session_id, user.id, remember, expires_at)
        .map_err(ApiError::internal)?;

    let token = create_token(&state.jwt_secret, user.id, &user.username, &session_id, expires_at)
        .map_err(ApiError::internal)?;

    Ok(AuthResponse {
        user: user.into_user(),
        token,
        expires_at,
    })
}

pub fn create_token(
    secret: &str,
    user_id: i64,
    username: &str,
    session_id: &str,
    expires_at: DateTime<Utc>,
) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        sid: session_id.to_string(),
        exp: expires_at.timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}

/// Verify signature and expiry. Does not check the session row.
pub fn decode_token(secret: &str, token: &str) -> anyhow::Result<Claims> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )?;
    Ok(token_data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_is_salted_phc_not_plaintext() {
        let first = hash_password("hunter22").unwrap();
        let second = hash_password("hunter22").unwrap();

        assert!(first.starts_with("$argon2id$"));
        assert!(!first.contains("hunter22"));
        assert_ne!(first, second, "salt must differ per hash");
    }

    #[test]
    fn verify_accepts_only_the_right_password() {
        let hash = hash_password("hunter22").unwrap();
        assert!(verify_password(&hash, "hunter22").unwrap());
        assert!(!verify_password(&hash, "hunter23").unwrap());
        assert!(!verify_password(&hash, "").unwrap());
    }

    #[test]
    fn corrupt_hash_is_an_internal_error() {
        assert!(matches!(verify_password("plaintext", "plaintext"), Err(ApiError::Internal(_))));
    }

    #[test]
    fn token_roundtrip_and_wrong_secret() {
        let expires = Utc::now() + Duration::hours(1);
        let token = create_token("secret", 7, "alice", "sid-1", expires).unwrap();

        let claims = decode_token("secret", &token).unwrap();
        assert_eq!(claims.sub, 7);
        assert_eq!(claims.sid, "sid-1");
        assert!(decode_token("other", &token).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let expired = Utc::now() - Duration::hours(2);
        let token = create_token("secret", 7, "alice", "sid-1", expired).unwrap();
        assert!(decode_token("secret", &token).is_err());
    }
}
