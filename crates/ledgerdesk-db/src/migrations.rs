use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (messaging schema)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id          TEXT PRIMARY KEY,
                email       TEXT NOT NULL UNIQUE,
                password    TEXT NOT NULL,
                created_at  TEXT NOT NULL
            );

            CREATE TABLE profiles (
                id          TEXT PRIMARY KEY,
                full_name   TEXT NOT NULL,
                avatar_url  TEXT,
                email       TEXT NOT NULL,
                created_at  TEXT NOT NULL
            );

            CREATE TABLE conversations (
                id          TEXT PRIMARY KEY,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                title       TEXT,
                is_group    INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX idx_conversations_updated
                ON conversations(updated_at);

            CREATE TABLE messages (
                id              TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                sender_id       TEXT NOT NULL REFERENCES profiles(id),
                content         TEXT NOT NULL,
                created_at      TEXT NOT NULL
            );

            CREATE INDEX idx_messages_conversation
                ON messages(conversation_id, created_at);

            CREATE TABLE conversation_participants (
                conversation_id      TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                user_id              TEXT NOT NULL REFERENCES profiles(id),
                joined_at            TEXT NOT NULL,
                last_read_message_id TEXT REFERENCES messages(id) ON DELETE SET NULL,
                PRIMARY KEY (conversation_id, user_id)
            );

            CREATE INDEX idx_participants_user
                ON conversation_participants(user_id);

            CREATE TABLE message_attachments (
                id          TEXT PRIMARY KEY,
                message_id  TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                file_path   TEXT NOT NULL,
                file_name   TEXT NOT NULL,
                file_size   INTEGER NOT NULL,
                file_type   TEXT NOT NULL,
                created_at  TEXT NOT NULL
            );

            CREATE INDEX idx_attachments_message
                ON message_attachments(message_id);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
