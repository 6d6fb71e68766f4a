use std::sync::Mutex;

use convo_core::types::{Attachment, MessageType};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, instrument};

use crate::error::{Result, StoreError};
use crate::types::{Branch, Message, NewMessage, Session};

/// Thread-safe manager for the session/branch/message/blob graph.
///
/// Wraps a single SQLite connection in a `Mutex`. Every multi-row mutation
/// (append + parent relink, branch-switch pointer rewrites, deletion) runs
/// inside one `rusqlite` transaction so a reader never observes a half
/// applied step.
pub struct MessageStore {
    db: Mutex<Connection>,
}

impl MessageStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    #[instrument(skip(self, system_prompt))]
    pub fn create_session(
        &self,
        name: &str,
        system_prompt: &str,
        workspace_id: &str,
    ) -> Result<(Session, Branch)> {
        let session_id = uuid::Uuid::now_v7().to_string();
        let branch_id = uuid::Uuid::now_v7().to_string();
        let now = chrono::Utc::now().to_rfc3339();

        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO sessions
             (id, name, system_prompt, workspace_id, primary_branch_id, chosen_first_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?6)",
            params![session_id, name, system_prompt, workspace_id, branch_id, now],
        )?;
        tx.execute(
            "INSERT INTO branches
             (id, session_id, parent_branch_id, branch_from_message_id, created_at, pending_confirmation)
             VALUES (?1, ?2, NULL, NULL, ?3, NULL)",
            params![branch_id, session_id, now],
        )?;
        tx.commit()?;
        drop(db);

        debug!(session_id, branch_id, "created session");
        Ok((self.fetch_session(&session_id)?, self.fetch_branch(&branch_id)?))
    }

    #[instrument(skip(self))]
    pub fn create_branch(
        &self,
        session_id: &str,
        parent_branch_id: Option<&str>,
        branch_from_message_id: Option<i64>,
    ) -> Result<Branch> {
        let branch_id = uuid::Uuid::now_v7().to_string();
        let now = chrono::Utc::now().to_rfc3339();

        match (parent_branch_id, branch_from_message_id) {
            (None, None) | (Some(_), Some(_)) => {}
            _ => {
                return Err(StoreError::Constraint(
                    "parent_branch_id and branch_from_message_id must both be set or both null"
                        .into(),
                ))
            }
        }

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO branches
             (id, session_id, parent_branch_id, branch_from_message_id, created_at, pending_confirmation)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
            params![branch_id, session_id, parent_branch_id, branch_from_message_id, now],
        )?;
        drop(db);

        self.fetch_branch(&branch_id)
    }

    /// Append a new message, filling `parent_message_id` and — when a
    /// parent is given — relinking the parent's `chosen_next_id` in the
    /// same transaction. `user_text` messages are indexed immediately
    /// (their full text is known at creation); every other type is left
    /// unindexed until `finalize_text` (or never, for types the spec
    /// never indexes).
    #[instrument(skip(self, msg))]
    pub fn append_message(
        &self,
        session_id: &str,
        branch_id: &str,
        parent_message_id: Option<i64>,
        msg: NewMessage,
    ) -> Result<Message> {
        let msg_type = msg
            .msg_type
            .ok_or_else(|| StoreError::Constraint("message type is required".into()))?;
        let now = chrono::Utc::now().to_rfc3339();
        let attachments_json = serde_json::to_string(&msg.attachments)?;

        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;

        tx.execute(
            "INSERT INTO messages
             (session_id, branch_id, parent_message_id, chosen_next_id, text, msg_type,
              attachments, cumul_token_count, model, generation, state, aux, created_at, indexed)
             VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6, NULL, ?7, ?8, ?9, ?10, ?11, 0)",
            params![
                session_id,
                branch_id,
                parent_message_id,
                msg.text,
                msg_type.as_str(),
                attachments_json,
                msg.model,
                msg.generation,
                msg.state,
                msg.aux,
                now,
            ],
        )?;
        let id = tx.last_insert_rowid();

        if let Some(parent_id) = parent_message_id {
            let changed = tx.execute(
                "UPDATE messages SET chosen_next_id = ?1 WHERE id = ?2",
                params![id, parent_id],
            )?;
            if changed == 0 {
                return Err(StoreError::MessageNotFound(parent_id));
            }
        }

        let indexed = matches!(msg_type, MessageType::UserText);
        if indexed {
            sync_fts_insert(&tx, id, &msg.text)?;
            tx.execute("UPDATE messages SET indexed = 1 WHERE id = ?1", params![id])?;
        }

        tx.commit()?;
        drop(db);

        self.fetch_message(id)
    }

    /// Append a delta to an in-flight message's text without touching the
    /// FTS indices — used for `model_text` streaming deltas.
    #[instrument(skip(self, delta))]
    pub fn append_text(&self, message_id: i64, delta: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE messages SET text = text || ?1 WHERE id = ?2",
            params![delta, message_id],
        )?;
        if changed == 0 {
            return Err(StoreError::MessageNotFound(message_id));
        }
        Ok(())
    }

    pub fn update_text(&self, message_id: i64, text: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE messages SET text = ?1 WHERE id = ?2",
            params![text, message_id],
        )?;
        if changed == 0 {
            return Err(StoreError::MessageNotFound(message_id));
        }
        Ok(())
    }

    /// Set the final text for a message and sync the FTS indices — the
    /// indexing point for `model_text` (§4.1: "indexing happens once, at
    /// message finalization").
    #[instrument(skip(self, text))]
    pub fn finalize_text(&self, message_id: i64, text: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE messages SET text = ?1, indexed = 1 WHERE id = ?2",
            params![text, message_id],
        )?;
        if changed == 0 {
            return Err(StoreError::MessageNotFound(message_id));
        }
        sync_fts_insert(&db, message_id, text)?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn update_token_count(&self, message_id: i64, count: i64) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE messages SET cumul_token_count = ?1 WHERE id = ?2",
            params![count, message_id],
        )?;
        if changed == 0 {
            return Err(StoreError::MessageNotFound(message_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn update_chosen_next_id(&self, parent_id: i64, child_id: Option<i64>) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE messages SET chosen_next_id = ?1 WHERE id = ?2",
            params![child_id, parent_id],
        )?;
        if changed == 0 {
            return Err(StoreError::MessageNotFound(parent_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn update_primary_branch(&self, session_id: &str, branch_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE sessions SET primary_branch_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![branch_id, chrono::Utc::now().to_rfc3339(), session_id],
        )?;
        if changed == 0 {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }

    /// Set a session's display name — used by the orchestrator's
    /// best-effort post-completion name inference.
    #[instrument(skip(self))]
    pub fn rename_session(&self, session_id: &str, name: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE sessions SET name = ?1, updated_at = ?2 WHERE id = ?3",
            params![name, chrono::Utc::now().to_rfc3339(), session_id],
        )?;
        if changed == 0 {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn update_chosen_first_id(&self, session_id: &str, message_id: Option<i64>) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE sessions SET chosen_first_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![message_id, chrono::Utc::now().to_rfc3339(), session_id],
        )?;
        if changed == 0 {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn set_pending_confirmation(&self, branch_id: &str, payload: Option<&str>) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE branches SET pending_confirmation = ?1 WHERE id = ?2",
            params![payload, branch_id],
        )?;
        if changed == 0 {
            return Err(StoreError::BranchNotFound(branch_id.to_string()));
        }
        Ok(())
    }

    pub fn fetch_message(&self, id: i64) -> Result<Message> {
        let db = self.db.lock().unwrap();
        db.query_row(SELECT_MESSAGE, params![id], row_to_message)
            .optional()?
            .ok_or(StoreError::MessageNotFound(id))
    }

    pub fn fetch_message_opt(&self, id: i64) -> Result<Option<Message>> {
        let db = self.db.lock().unwrap();
        Ok(db.query_row(SELECT_MESSAGE, params![id], row_to_message).optional()?)
    }

    pub fn fetch_branch(&self, id: &str) -> Result<Branch> {
        let db = self.db.lock().unwrap();
        db.query_row(SELECT_BRANCH, params![id], row_to_branch)
            .optional()?
            .ok_or_else(|| StoreError::BranchNotFound(id.to_string()))
    }

    pub fn fetch_session(&self, id: &str) -> Result<Session> {
        let db = self.db.lock().unwrap();
        db.query_row(SELECT_SESSION, params![id], row_to_session)
            .optional()?
            .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))
    }

    /// Children of a message (`parent_message_id = id`), in identifier
    /// order — the "possible branches" sibling hint.
    pub fn children_of(&self, parent_id: i64) -> Result<Vec<Message>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "{SELECT_MESSAGE_BASE} WHERE parent_message_id = ?1 ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![parent_id], row_to_message)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Root messages (no parent) of a session, earliest first.
    pub fn roots_of_session(&self, session_id: &str) -> Result<Vec<Message>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "{SELECT_MESSAGE_BASE} WHERE session_id = ?1 AND parent_message_id IS NULL ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![session_id], row_to_message)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// All messages belonging to one branch, identifier-ascending.
    pub fn messages_in_branch(&self, branch_id: &str) -> Result<Vec<Message>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "{SELECT_MESSAGE_BASE} WHERE branch_id = ?1 ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![branch_id], row_to_message)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// The highest-identifier message currently in a branch, if any —
    /// used by the Message Chain to seed its cursor cache.
    pub fn latest_message_in_branch(&self, branch_id: &str) -> Result<Option<Message>> {
        let db = self.db.lock().unwrap();
        Ok(db
            .query_row(
                &format!("{SELECT_MESSAGE_BASE} WHERE branch_id = ?1 ORDER BY id DESC LIMIT 1"),
                params![branch_id],
                row_to_message,
            )
            .optional()?)
    }

    /// Narrow deletion path: used only to trim trailing error messages on
    /// retry. Relinks the parent's `chosen_next_id` to `None`.
    #[instrument(skip(self))]
    pub fn delete_message(&self, id: i64) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let parent: Option<i64> = tx
            .query_row(
                "SELECT parent_message_id FROM messages WHERE id = ?1",
                params![id],
                |r| r.get(0),
            )
            .optional()?
            .ok_or(StoreError::MessageNotFound(id))?;
        if let Some(parent_id) = parent {
            tx.execute(
                "UPDATE messages SET chosen_next_id = NULL WHERE id = ?1 AND chosen_next_id = ?2",
                params![parent_id, id],
            )?;
        }
        tx.execute("DELETE FROM messages WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    /// Delete a session, its branches, its messages, and any blobs no
    /// longer referenced by another message's attachments.
    #[instrument(skip(self))]
    pub fn delete_session(&self, session_id: &str) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;

        let hashes: Vec<String> = {
            let mut stmt =
                tx.prepare("SELECT attachments FROM messages WHERE session_id = ?1")?;
            let rows = stmt.query_map(params![session_id], |r| r.get::<_, String>(0))?;
            let mut out = Vec::new();
            for row in rows.filter_map(|r| r.ok()) {
                if let Ok(atts) = serde_json::from_str::<Vec<Attachment>>(&row) {
                    out.extend(atts.into_iter().map(|a| a.hash));
                }
            }
            out
        };

        let changed = tx.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
        if changed == 0 {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }
        tx.execute(
            "DELETE FROM branches WHERE session_id = ?1",
            params![session_id],
        )?;
        tx.execute(
            "DELETE FROM messages WHERE session_id = ?1",
            params![session_id],
        )?;

        for hash in hashes {
            let still_used: i64 = tx.query_row(
                "SELECT COUNT(*) FROM messages WHERE attachments LIKE '%' || ?1 || '%'",
                params![hash],
                |r| r.get(0),
            )?;
            if still_used == 0 {
                tx.execute("DELETE FROM blobs WHERE hash = ?1", params![hash])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Run `save_blob` inside this store's connection.
    pub fn save_blob(&self, bytes: &[u8]) -> Result<String> {
        let db = self.db.lock().unwrap();
        crate::blob::save_blob(&db, bytes)
    }

    pub fn load_blob(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        let db = self.db.lock().unwrap();
        crate::blob::load_blob(&db, hash)
    }
}

fn sync_fts_insert(conn: &Connection, message_id: i64, text: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO messages_fts_stem(rowid, text) VALUES (?1, ?2)",
        params![message_id, text],
    )?;
    conn.execute(
        "INSERT INTO messages_fts_trigram(rowid, text) VALUES (?1, ?2)",
        params![message_id, text],
    )?;
    Ok(())
}

const SELECT_MESSAGE_BASE: &str = "SELECT id, session_id, branch_id, parent_message_id, \
    chosen_next_id, text, msg_type, attachments, cumul_token_count, model, generation, state, \
    aux, created_at, indexed FROM messages";
const SELECT_MESSAGE: &str = "SELECT id, session_id, branch_id, parent_message_id, \
    chosen_next_id, text, msg_type, attachments, cumul_token_count, model, generation, state, \
    aux, created_at, indexed FROM messages WHERE id = ?1";
const SELECT_BRANCH: &str = "SELECT id, session_id, parent_branch_id, branch_from_message_id, \
    created_at, pending_confirmation FROM branches WHERE id = ?1";
const SELECT_SESSION: &str = "SELECT id, name, system_prompt, workspace_id, primary_branch_id, \
    chosen_first_id, created_at, updated_at FROM sessions WHERE id = ?1";

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let msg_type_str: String = row.get(6)?;
    let attachments_str: String = row.get(7)?;
    Ok(Message {
        id: row.get(0)?,
        session_id: row.get(1)?,
        branch_id: row.get(2)?,
        parent_message_id: row.get(3)?,
        chosen_next_id: row.get(4)?,
        text: row.get(5)?,
        msg_type: msg_type_str.parse().unwrap_or(MessageType::Error),
        attachments: serde_json::from_str(&attachments_str).unwrap_or_default(),
        cumul_token_count: row.get(8)?,
        model: row.get(9)?,
        generation: row.get(10)?,
        state: row.get(11)?,
        aux: row.get(12)?,
        created_at: row.get(13)?,
        indexed: row.get::<_, i64>(14)? != 0,
    })
}

fn row_to_branch(row: &rusqlite::Row<'_>) -> rusqlite::Result<Branch> {
    Ok(Branch {
        id: row.get(0)?,
        session_id: row.get(1)?,
        parent_branch_id: row.get(2)?,
        branch_from_message_id: row.get(3)?,
        created_at: row.get(4)?,
        pending_confirmation: row.get(5)?,
    })
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        name: row.get(1)?,
        system_prompt: row.get(2)?,
        workspace_id: row.get(3)?,
        primary_branch_id: row.get(4)?,
        chosen_first_id: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use convo_core::types::MessageType;

    fn new_store() -> MessageStore {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        MessageStore::new(conn)
    }

    #[test]
    fn create_session_also_creates_initial_branch() {
        let store = new_store();
        let (session, branch) = store.create_session("", "you are helpful", "ws1").unwrap();
        assert_eq!(session.primary_branch_id, branch.id);
        assert!(branch.parent_branch_id.is_none());
        assert!(branch.branch_from_message_id.is_none());
    }

    #[test]
    fn append_message_links_parent_chosen_next_id() {
        let store = new_store();
        let (session, branch) = store.create_session("", "sp", "ws1").unwrap();
        let user = store
            .append_message(
                &session.id,
                &branch.id,
                None,
                NewMessage::new(MessageType::UserText, "hello"),
            )
            .unwrap();
        let model = store
            .append_message(
                &session.id,
                &branch.id,
                Some(user.id),
                NewMessage::new(MessageType::ModelText, ""),
            )
            .unwrap();

        let parent = store.fetch_message(user.id).unwrap();
        assert_eq!(parent.chosen_next_id, Some(model.id));
        assert_eq!(model.parent_message_id, Some(user.id));
    }

    #[test]
    fn user_text_is_indexed_immediately() {
        let store = new_store();
        let (session, branch) = store.create_session("", "sp", "ws1").unwrap();
        let user = store
            .append_message(
                &session.id,
                &branch.id,
                None,
                NewMessage::new(MessageType::UserText, "the quick fox"),
            )
            .unwrap();
        assert!(user.indexed);
    }

    #[test]
    fn save_blob_idempotent_through_store() {
        let store = new_store();
        let h1 = store.save_blob(b"abc").unwrap();
        let h2 = store.save_blob(b"abc").unwrap();
        assert_eq!(h1, h2);
        assert_eq!(store.load_blob(&h1).unwrap().unwrap(), b"abc");
    }

    #[test]
    fn delete_session_removes_messages_and_branches() {
        let store = new_store();
        let (session, branch) = store.create_session("", "sp", "ws1").unwrap();
        store
            .append_message(
                &session.id,
                &branch.id,
                None,
                NewMessage::new(MessageType::UserText, "hi"),
            )
            .unwrap();
        store.delete_session(&session.id).unwrap();
        assert!(store.fetch_session(&session.id).is_err());
        assert!(store.fetch_branch(&branch.id).is_err());
    }
}
