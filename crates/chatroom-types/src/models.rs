use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = i64;
pub type RoomId = i64;
pub type MessageId = i64;

/// The room every connection joins on open. Seeded by the schema.
pub const LOBBY_ROOM_ID: RoomId = 1;

/// A registered user as seen by the user themselves.
/// The password hash lives only in the database row type and never
/// crosses the API boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub username: String,
    pub website: Option<String>,
    pub bio: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A user as seen by other users (no email).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicUser {
    pub id: UserId,
    pub username: String,
    pub website: Option<String>,
    pub bio: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<User> for PublicUser {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            website: user.website,
            bio: user.bio,
            created_at: user.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A persisted chat message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub room_id: RoomId,
    pub author_id: UserId,
    pub author_username: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}
