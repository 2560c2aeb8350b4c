use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            email           TEXT NOT NULL UNIQUE,
            username        TEXT NOT NULL,
            password_hash   TEXT NOT NULL,
            email_hash      TEXT NOT NULL,
            website         TEXT,
            bio             TEXT,
            created_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS rooms (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            name        TEXT NOT NULL UNIQUE,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            room_id     INTEGER NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
            author_id   INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            body        TEXT NOT NULL,
            timestamp   TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_timestamp
            ON messages(timestamp);

        CREATE INDEX IF NOT EXISTS idx_messages_room
            ON messages(room_id, id);

        CREATE TABLE IF NOT EXISTS sessions (
            id          TEXT PRIMARY KEY,
            user_id     INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            remember    INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL,
            expires_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sessions_user
            ON sessions(user_id);

        -- Seed the lobby
        INSERT OR IGNORE INTO rooms (id, name, created_at)
            VALUES (1, 'lobby', strftime('%Y-%m-%dT%H:%M:%fZ', 'now'));
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}

pub fn drop_all(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        DROP TABLE IF EXISTS sessions;
        DROP TABLE IF EXISTS messages;
        DROP TABLE IF EXISTS rooms;
        DROP TABLE IF EXISTS users;
        ",
    )?;

    info!("Dropped all tables");
    Ok(())
}
