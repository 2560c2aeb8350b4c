//! Database row types: these map directly to SQLite rows.
//! Distinct from chatroom-types API models to keep the DB layer independent.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};

use chatroom_types::models::{Message, MessageId, PublicUser, Room, RoomId, User, UserId};

pub struct UserRow {
    pub id: UserId,
    pub email: String,
    pub username: String,
    pub password_hash: String,
    pub email_hash: String,
    pub website: Option<String>,
    pub bio: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for UserRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserRow")
            .field("id", &self.id)
            .field("email", &self.email)
            .field("username", &self.username)
            .field("password_hash", &"<redacted>")
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct RoomRow {
    pub id: RoomId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct MessageRow {
    pub id: MessageId,
    pub room_id: RoomId,
    pub author_id: UserId,
    pub author_username: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
pub struct SessionRow {
    pub id: String,
    pub user_id: UserId,
    pub remember: bool,
    pub created_at: String,
    pub expires_at: String,
}

impl UserRow {
    pub fn into_user(self) -> User {
        User {
            created_at: self.created_at,
            id: self.id,
            email: self.email,
            username: self.username,
            website: self.website,
            bio: self.bio,
        }
    }

    pub fn into_public(self) -> PublicUser {
        self.into_user().into()
    }
}

impl From<RoomRow> for Room {
    fn from(row: RoomRow) -> Self {
        Room {
            created_at: row.created_at,
            id: row.id,
            name: row.name,
        }
    }
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Message {
            timestamp: row.timestamp,
            id: row.id,
            room_id: row.room_id,
            author_id: row.author_id,
            author_username: row.author_username,
            body: row.body,
        }
    }
}

/// Fixed-width RFC 3339 so stored timestamps sort lexicographically.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .or_else(|_| {
            // Rows written by sqlite's datetime('now') have no timezone.
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
}

/// Read a timestamp column; unparseable text fails the row.
pub(crate) fn timestamp_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}
