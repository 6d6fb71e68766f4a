use rusqlite::Connection;

use crate::error::Result;

/// Initialise all tables, indices, and FTS5 virtual tables. Safe to call on
/// every startup — uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    create_sessions_table(conn)?;
    create_branches_table(conn)?;
    create_messages_table(conn)?;
    create_blobs_table(conn)?;
    create_fts_indices(conn)?;
    Ok(())
}

fn create_sessions_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
            id                TEXT PRIMARY KEY,
            name              TEXT NOT NULL DEFAULT '',
            system_prompt     TEXT NOT NULL DEFAULT '',
            workspace_id      TEXT NOT NULL DEFAULT '',
            primary_branch_id TEXT NOT NULL,
            chosen_first_id   INTEGER,
            created_at        TEXT NOT NULL,
            updated_at        TEXT NOT NULL
        );",
    )?;
    Ok(())
}

fn create_branches_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS branches (
            id                     TEXT PRIMARY KEY,
            session_id             TEXT NOT NULL,
            parent_branch_id       TEXT,
            branch_from_message_id INTEGER,
            created_at             TEXT NOT NULL,
            pending_confirmation   TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_branches_session
            ON branches(session_id);",
    )?;
    Ok(())
}

fn create_messages_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS messages (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id        TEXT NOT NULL,
            branch_id         TEXT NOT NULL,
            parent_message_id INTEGER,
            chosen_next_id    INTEGER,
            text              TEXT NOT NULL DEFAULT '',
            msg_type          TEXT NOT NULL,
            attachments       TEXT NOT NULL DEFAULT '[]',
            cumul_token_count INTEGER,
            model             TEXT,
            generation        INTEGER NOT NULL DEFAULT 0,
            state             TEXT,
            aux               TEXT,
            created_at        TEXT NOT NULL,
            indexed           INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_messages_session
            ON messages(session_id, id);
        CREATE INDEX IF NOT EXISTS idx_messages_branch
            ON messages(branch_id, id);
        CREATE INDEX IF NOT EXISTS idx_messages_parent
            ON messages(parent_message_id);",
    )?;
    Ok(())
}

fn create_blobs_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS blobs (
            hash       TEXT PRIMARY KEY,
            bytes      BLOB NOT NULL,
            created_at TEXT NOT NULL
        );",
    )?;
    Ok(())
}

/// Two external-content FTS5 tables over `messages(text)`: `porter` for
/// word-stem search, `trigram` for substring search. Both are synced
/// manually on write — `content=''` tables do not track the source table.
fn create_fts_indices(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts_stem
            USING fts5(text, content='', tokenize='porter unicode61');
         CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts_trigram
            USING fts5(text, content='', tokenize='trigram');",
    )?;
    Ok(())
}
