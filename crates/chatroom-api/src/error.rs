//! API error type and its JSON rendering.

use std::collections::BTreeMap;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;
use validator::ValidationErrors;

use chatroom_gateway::broker::BrokerError;
use chatroom_types::api::{ErrorBody, ErrorResponse};

pub const LOGIN_PATH: &str = "/auth/login";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("validation failed")]
    Validation(#[from] ValidationErrors),

    #[error("{0}")]
    BadRequest(String),

    #[error("invalid email or password")]
    InvalidCredentials,

    #[error("authentication required")]
    Unauthorized,

    #[error("{0} not found")]
    NotFound(String),

    #[error("email already registered, please log in")]
    DuplicateEmail,

    #[error("{0}")]
    Conflict(String),

    #[error("internal server error")]
    Internal(#[source] anyhow::Error),
}

impl ApiError {
    pub fn internal(err: impl Into<anyhow::Error>) -> Self {
        Self::Internal(err.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::InvalidCredentials | Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::DuplicateEmail | Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::BadRequest(_) => "bad_request",
            Self::InvalidCredentials => "invalid_credentials",
            Self::Unauthorized => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::DuplicateEmail => "duplicate_email",
            Self::Conflict(_) => "conflict",
            Self::Internal(_) => "internal",
        }
    }

    fn redirect(&self) -> Option<String> {
        match self {
            Self::InvalidCredentials | Self::DuplicateEmail => Some(LOGIN_PATH.to_string()),
            _ => None,
        }
    }

    fn fields(&self) -> BTreeMap<String, Vec<String>> {
        let Self::Validation(errors) = self else {
            return BTreeMap::new();
        };

        errors
            .field_errors()
            .into_iter()
            .map(|(field, errs)| {
                let messages = errs
                    .iter()
                    .map(|e| {
                        e.message
                            .as_ref()
                            .map(|m| m.to_string())
                            .unwrap_or_else(|| e.code.to_string())
                    })
                    .collect();
                (field.to_string(), messages)
            })
            .collect()
    }
}

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::EmptyBody | BrokerError::BodyTooLong { .. } => Self::BadRequest(err.to_string()),
            BrokerError::InvalidSession => Self::Unauthorized,
            BrokerError::RoomNotFound(room_id) => Self::NotFound(format!("room {room_id}")),
            BrokerError::Store(e) => Self::Internal(e),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Internal(e) = &self {
            error!("Internal error: {:#}", e);
        }

        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code().to_string(),
                message: self.to_string(),
                redirect: self.redirect(),
                fields: self.fields(),
            },
        };

        (self.status(), Json(body)).into_response()
    }
}

/// Fallback for unknown routes.
pub async fn not_found() -> ApiError {
    ApiError::not_found("route")
}
