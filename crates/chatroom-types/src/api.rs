use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::models::{Message, MessageId, User, UserId};

// -- JWT Claims --

/// JWT claims shared across chatroom-api (REST middleware) and the gateway
/// upgrade. `sid` names the server-side session row the token is bound to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: UserId,
    pub username: String,
    pub sid: String,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    #[validate(length(min = 1, max = 64, message = "Username must be 1-64 characters"))]
    pub username: String,

    #[validate(
        email(message = "Invalid email address"),
        length(max = 254, message = "Email is too long")
    )]
    pub email: String,

    #[validate(
        length(min = 6, message = "Password must be at least 6 characters"),
        must_match(other = "password2", message = "Passwords do not match")
    )]
    pub password: String,

    pub password2: String,
}

impl RegisterRequest {
    /// Trim the username and canonicalize the email before validation.
    pub fn normalized(self) -> Self {
        Self {
            username: self.username.trim().to_string(),
            email: self.email.trim().to_lowercase(),
            ..self
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    #[validate(email(message = "Invalid email address"))]
    pub email: String,

    #[validate(length(min = 1, message = "Password is required"))]
    pub password: String,

    #[serde(default)]
    pub remember: bool,
}

/// Returned by both register and login.
#[derive(Debug, Serialize, Deserialize)]
pub struct AuthResponse {
    pub user: User,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

// -- Profile --

#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct UpdateProfileRequest {
    #[validate(length(min = 1, max = 64, message = "Username must be 1-64 characters"))]
    pub username: String,

    #[validate(
        url(message = "Website must be a valid URL"),
        length(max = 128, message = "Website must be at most 128 characters")
    )]
    #[serde(default)]
    pub website: Option<String>,

    #[validate(length(max = 120, message = "Bio must be at most 120 characters"))]
    #[serde(default)]
    pub bio: Option<String>,
}

impl UpdateProfileRequest {
    /// Blank optional fields clear the stored value.
    pub fn normalized(self) -> Self {
        fn blank_to_none(value: Option<String>) -> Option<String> {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        }

        Self {
            username: self.username.trim().to_string(),
            website: blank_to_none(self.website),
            bio: blank_to_none(self.bio),
        }
    }
}

// -- Rooms --

#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CreateRoomRequest {
    #[validate(length(min = 1, max = 64, message = "Room name must be 1-64 characters"))]
    pub name: String,
}

impl CreateRoomRequest {
    pub fn normalized(self) -> Self {
        Self {
            name: self.name.trim().to_string(),
        }
    }
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub body: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    /// Pass as `before` to fetch the next older page; absent on the last page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_before: Option<MessageId>,
}

// -- Health --

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub connections: usize,
    pub online_users: usize,
}

// -- Errors --

/// Every API error renders with this shape.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable machine-readable code, e.g. `duplicate_email`.
    pub code: String,
    pub message: String,
    /// Where a browser client should send the user next.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,
    /// Field name -> validation messages.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, Vec<String>>,
}
