use crate::Database;
use crate::models::{MessageRow, RoomRow, SessionRow, UserRow, format_timestamp, timestamp_column};
use anyhow::{Result, anyhow};
use chatroom_types::models::{MessageId, RoomId, UserId};
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use rusqlite::{Connection, ErrorCode};

const USER_COLUMNS: &str =
    "id, email, username, password_hash, email_hash, website, bio, created_at";

impl Database {
    // -- Users --

    /// Insert a user. `email` is expected lowercased already.
    pub fn create_user(&self, email: &str, username: &str, password_hash: &str) -> Result<UserRow> {
        let email_hash = hex::encode(Md5::digest(email.as_bytes()));
        let created_at = format_timestamp(Utc::now());

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (email, username, password_hash, email_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                (email, username, password_hash, &email_hash, &created_at),
            )?;
            let id = conn.last_insert_rowid();
            query_user(conn, "id", &id)?.ok_or_else(|| anyhow!("User {} vanished after insert", id))
        })
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "email", &email))
    }

    pub fn get_user_by_id(&self, id: UserId) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", &id))
    }

    pub fn update_profile(
        &self,
        id: UserId,
        username: &str,
        website: Option<&str>,
        bio: Option<&str>,
    ) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET username = ?1, website = ?2, bio = ?3 WHERE id = ?4",
                rusqlite::params![username, website, bio, id],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            query_user(conn, "id", &id)
        })
    }

    /// Delete a user; their messages and sessions go with them.
    pub fn delete_user(&self, id: UserId) -> Result<bool> {
        self.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM users WHERE id = ?1", [id])?;
            Ok(deleted > 0)
        })
    }

    // -- Rooms --

    pub fn list_rooms(&self) -> Result<Vec<RoomRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, name, created_at FROM rooms ORDER BY id")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(RoomRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        created_at: timestamp_column(row, 2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_room(&self, id: RoomId) -> Result<Option<RoomRow>> {
        self.with_conn(|conn| query_room(conn, id))
    }

    pub fn create_room(&self, name: &str) -> Result<RoomRow> {
        let created_at = format_timestamp(Utc::now());
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO rooms (name, created_at) VALUES (?1, ?2)",
                (name, &created_at),
            )?;
            let id = conn.last_insert_rowid();
            query_room(conn, id)?.ok_or_else(|| anyhow!("Room {} vanished after insert", id))
        })
    }

    // -- Messages --

    /// Insert a message and return it joined with its author's username.
    /// Fails if the author or room does not exist.
    pub fn insert_message(
        &self,
        room_id: RoomId,
        author_id: UserId,
        body: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<MessageRow> {
        let ts = format_timestamp(timestamp);
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO messages (room_id, author_id, body, timestamp) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![room_id, author_id, body, ts],
            )?;
            let id = tx.last_insert_rowid();
            let row = query_message(&tx, id)?
                .ok_or_else(|| anyhow!("Message {} vanished after insert", id))?;
            tx.commit()?;
            Ok(row)
        })
    }

    /// Up to `limit` messages older than `before` (exclusive), oldest first.
    pub fn get_messages(
        &self,
        room_id: RoomId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| query_messages(conn, room_id, limit, before))
    }

    // -- Sessions --

    pub fn create_session(
        &self,
        id: &str,
        user_id: UserId,
        remember: bool,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let created_at = format_timestamp(Utc::now());
        let expires_at = format_timestamp(expires_at);
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, user_id, remember, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id, user_id, remember, created_at, expires_at],
            )?;
            Ok(())
        })
    }

    /// A session that exists and has not expired as of `now`.
    pub fn get_active_session(&self, id: &str, now: DateTime<Utc>) -> Result<Option<SessionRow>> {
        let now = format_timestamp(now);
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, user_id, remember, created_at, expires_at
                 FROM sessions WHERE id = ?1 AND expires_at > ?2",
                rusqlite::params![id, now],
                |row| {
                    Ok(SessionRow {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        remember: row.get(2)?,
                        created_at: row.get(3)?,
                        expires_at: row.get(4)?,
                    })
                },
            )
            .optional()
        })
    }

    pub fn delete_session(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM sessions WHERE id = ?1", [id])?;
            Ok(deleted > 0)
        })
    }

    pub fn purge_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        let now = format_timestamp(now);
        self.with_conn(|conn| {
            let purged = conn.execute("DELETE FROM sessions WHERE expires_at <= ?1", [now])?;
            Ok(purged)
        })
    }
}

/// True when `err` came from a UNIQUE or FOREIGN KEY constraint.
pub fn is_constraint_violation(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<rusqlite::Error>(),
        Some(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation
    )
}

fn query_user(conn: &Connection, column: &str, value: &dyn rusqlite::ToSql) -> Result<Option<UserRow>> {
    // `column` is always a literal from this module
    let sql = format!("SELECT {} FROM users WHERE {} = ?1", USER_COLUMNS, column);
    let mut stmt = conn.prepare(&sql)?;

    stmt.query_row([value], |row| {
        Ok(UserRow {
            id: row.get(0)?,
            email: row.get(1)?,
            username: row.get(2)?,
            password_hash: row.get(3)?,
            email_hash: row.get(4)?,
            website: row.get(5)?,
            bio: row.get(6)?,
            created_at: timestamp_column(row, 7)?,
        })
    })
    .optional()
}

fn query_room(conn: &Connection, id: RoomId) -> Result<Option<RoomRow>> {
    conn.query_row(
        "SELECT id, name, created_at FROM rooms WHERE id = ?1",
        [id],
        |row| {
            Ok(RoomRow {
                id: row.get(0)?,
                name: row.get(1)?,
                created_at: timestamp_column(row, 2)?,
            })
        },
    )
    .optional()
}

fn map_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        room_id: row.get(1)?,
        author_id: row.get(2)?,
        author_username: row.get(3)?,
        body: row.get(4)?,
        timestamp: timestamp_column(row, 5)?,
    })
}

fn query_message(conn: &Connection, id: MessageId) -> Result<Option<MessageRow>> {
    conn.query_row(
        "SELECT m.id, m.room_id, m.author_id, u.username, m.body, m.timestamp
         FROM messages m
         JOIN users u ON m.author_id = u.id
         WHERE m.id = ?1",
        [id],
        map_message,
    )
    .optional()
}

fn query_messages(
    conn: &Connection,
    room_id: RoomId,
    limit: u32,
    before: Option<MessageId>,
) -> Result<Vec<MessageRow>> {
    // JOIN users to fetch author_username in a single query (no N+1)
    let mut stmt = conn.prepare(
        "SELECT m.id, m.room_id, m.author_id, u.username, m.body, m.timestamp
         FROM messages m
         JOIN users u ON m.author_id = u.id
         WHERE m.room_id = ?1 AND (?2 IS NULL OR m.id < ?2)
         ORDER BY m.id DESC
         LIMIT ?3",
    )?;

    let mut rows = stmt
        .query_map(rusqlite::params![room_id, before, limit], map_message)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.reverse();
    Ok(rows)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatroom_types::models::LOBBY_ROOM_ID;
    use chrono::Duration;

    fn db_with_user(email: &str) -> (Database, UserRow) {
        let db = Database::open_in_memory().unwrap();
        let user = db.create_user(email, "alice", "$argon2id$fake").unwrap();
        (db, user)
    }

    #[test]
    fn lobby_is_seeded() {
        let db = Database::open_in_memory().unwrap();
        let rooms = db.list_rooms().unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].id, LOBBY_ROOM_ID);
        assert_eq!(rooms[0].name, "lobby");
    }

    #[test]
    fn create_user_stores_email_hash() {
        let (db, user) = db_with_user("alice@example.com");
        assert_eq!(user.email_hash.len(), 32);

        let found = db.get_user_by_email("alice@example.com").unwrap().unwrap();
        assert_eq!(found.id, user.id);
        assert_eq!(found.password_hash, "$argon2id$fake");
    }

    #[test]
    fn duplicate_email_is_a_unique_violation() {
        let (db, _) = db_with_user("alice@example.com");
        let err = db
            .create_user("alice@example.com", "other", "$argon2id$fake")
            .unwrap_err();
        assert!(is_constraint_violation(&err));
    }

    #[test]
    fn message_requires_existing_author() {
        let (db, user) = db_with_user("alice@example.com");

        let err = db
            .insert_message(LOBBY_ROOM_ID, user.id + 100, "hello", Utc::now())
            .unwrap_err();
        assert!(is_constraint_violation(&err), "foreign key violation expected: {err}");

        let ok = db.insert_message(LOBBY_ROOM_ID, user.id, "hello", Utc::now()).unwrap();
        assert_eq!(ok.author_id, user.id);
        assert_eq!(ok.author_username, "alice");
    }

    #[test]
    fn messages_page_oldest_first() {
        let (db, user) = db_with_user("alice@example.com");
        let ids: Vec<MessageId> = (0..5)
            .map(|i| {
                db.insert_message(LOBBY_ROOM_ID, user.id, &format!("m{i}"), Utc::now())
                    .unwrap()
                    .id
            })
            .collect();

        let latest = db.get_messages(LOBBY_ROOM_ID, 2, None).unwrap();
        assert_eq!(latest.iter().map(|m| m.id).collect::<Vec<_>>(), vec![ids[3], ids[4]]);

        let older = db.get_messages(LOBBY_ROOM_ID, 10, Some(ids[3])).unwrap();
        assert_eq!(older.iter().map(|m| m.id).collect::<Vec<_>>(), ids[..3].to_vec());
    }

    #[test]
    fn messages_are_scoped_to_room() {
        let (db, user) = db_with_user("alice@example.com");
        let room = db.create_room("side").unwrap();
        db.insert_message(room.id, user.id, "in side", Utc::now()).unwrap();
        db.insert_message(LOBBY_ROOM_ID, user.id, "in lobby", Utc::now()).unwrap();

        let side = db.get_messages(room.id, 50, None).unwrap();
        assert_eq!(side.len(), 1);
        assert_eq!(side[0].body, "in side");
    }

    #[test]
    fn deleting_user_cascades() {
        let (db, user) = db_with_user("alice@example.com");
        db.insert_message(LOBBY_ROOM_ID, user.id, "bye", Utc::now()).unwrap();
        db.create_session("s1", user.id, false, Utc::now() + Duration::days(1)).unwrap();

        assert!(db.delete_user(user.id).unwrap());
        assert!(db.get_messages(LOBBY_ROOM_ID, 50, None).unwrap().is_empty());
        assert!(db.get_active_session("s1", Utc::now()).unwrap().is_none());
        assert!(!db.delete_user(user.id).unwrap());
    }

    #[test]
    fn expired_sessions_are_inactive_and_purged() {
        let (db, user) = db_with_user("alice@example.com");
        let now = Utc::now();
        db.create_session("live", user.id, true, now + Duration::days(30)).unwrap();
        db.create_session("dead", user.id, false, now - Duration::seconds(1)).unwrap();

        let live = db.get_active_session("live", now).unwrap().unwrap();
        assert!(live.remember);
        assert!(db.get_active_session("dead", now).unwrap().is_none());

        assert_eq!(db.purge_expired_sessions(now).unwrap(), 1);
        assert!(db.delete_session("live").unwrap());
        assert!(!db.delete_session("live").unwrap());
    }

    #[test]
    fn update_profile_sets_and_clears_fields() {
        let (db, user) = db_with_user("alice@example.com");
        let updated = db
            .update_profile(user.id, "alice2", Some("https://alice.dev"), Some("hi"))
            .unwrap()
            .unwrap();
        assert_eq!(updated.username, "alice2");
        assert_eq!(updated.website.as_deref(), Some("https://alice.dev"));

        let cleared = db.update_profile(user.id, "alice2", None, None).unwrap().unwrap();
        assert!(cleared.website.is_none());
        assert!(cleared.bio.is_none());

        assert!(db.update_profile(user.id + 1, "x", None, None).unwrap().is_none());
    }

    #[test]
    fn corrupt_timestamp_fails_the_read() {
        let (db, user) = db_with_user("alice@example.com");
        let message = db.insert_message(LOBBY_ROOM_ID, user.id, "hi", Utc::now()).unwrap();
        db.with_conn(|conn| {
            conn.execute("UPDATE messages SET timestamp = 'not a time' WHERE id = ?1", [message.id])?;
            Ok(())
        })
        .unwrap();

        assert!(db.get_messages(LOBBY_ROOM_ID, 10, None).is_err());
        // Untouched rows still read fine
        assert!(db.get_user_by_id(user.id).unwrap().is_some());
    }

    #[test]
    fn reset_drops_data_and_reseeds() {
        let (db, _) = db_with_user("alice@example.com");
        db.reset().unwrap();
        assert!(db.get_user_by_email("alice@example.com").unwrap().is_none());
        assert_eq!(db.list_rooms().unwrap().len(), 1);
    }

    #[test]
    fn file_database_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.db");

        {
            let db = Database::open(&path).unwrap();
            db.create_user("bob@example.com", "bob", "$argon2id$fake").unwrap();
        }

        let db = Database::open(&path).unwrap();
        assert!(db.get_user_by_email("bob@example.com").unwrap().is_some());
    }
}
