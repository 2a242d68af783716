use rusqlite::Connection;

use crate::error::Result;

/// Initialise transcript tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS conversations (
            id          INTEGER PRIMARY KEY,
            user_id     INTEGER NOT NULL,
            title       TEXT,
            agent_type  TEXT NOT NULL DEFAULT 'assistant',
            temporary   INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_conversations_user
            ON conversations(user_id, updated_at DESC);

        CREATE TABLE IF NOT EXISTS blocks (
            id                TEXT PRIMARY KEY,
            conversation_id   INTEGER NOT NULL,
            round_number      INTEGER NOT NULL,
            block_type        TEXT NOT NULL,
            mode              TEXT NOT NULL,
            status            TEXT NOT NULL,
            user_inputs       TEXT NOT NULL DEFAULT '[]',
            assistant_content TEXT,
            event_stream      TEXT NOT NULL DEFAULT '[]',
            session_stats     TEXT NOT NULL DEFAULT '{}',
            metadata          TEXT NOT NULL DEFAULT '{}',
            parent_block_id   TEXT,
            branch_path       TEXT NOT NULL,
            archived          INTEGER NOT NULL DEFAULT 0,
            created_at        TEXT NOT NULL,
            updated_at        TEXT NOT NULL,
            UNIQUE(conversation_id, round_number)
        );
        CREATE INDEX IF NOT EXISTS idx_blocks_conversation
            ON blocks(conversation_id, round_number);

        CREATE TABLE IF NOT EXISTS checkpoints (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id INTEGER NOT NULL,
            last_block_id   TEXT NOT NULL,
            summary         TEXT NOT NULL,
            token_usage     INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_checkpoints_conversation
            ON checkpoints(conversation_id, id DESC);",
    )?;
    Ok(())
}
