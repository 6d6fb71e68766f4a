pub mod error;
pub mod types;

use std::sync::{Arc, Mutex};

use convo_store::{types::NewMessage, Message, MessageStore};
use tracing::instrument;

pub use error::ChainError;
pub use types::{AttachmentInput, ChainAppend};

use error::Result;

#[derive(Debug, Clone)]
struct Cache {
    last: Option<i64>,
}

/// A short-lived cursor bound to `(session, branch)`. Caches the last
/// message identifier so every `add` only needs one round trip to the
/// store instead of a lookup-then-insert.
pub struct MessageChain {
    store: Arc<MessageStore>,
    session_id: String,
    branch_id: String,
    cache: Mutex<Cache>,
}

impl MessageChain {
    /// Open a cursor over `(session_id, branch_id)`, seeding the cache
    /// from the branch's current last message (if any).
    pub fn open(store: Arc<MessageStore>, session_id: &str, branch_id: &str) -> Result<Self> {
        let last = store
            .latest_message_in_branch(branch_id)?
            .map(|m| m.id);
        Ok(Self {
            store,
            session_id: session_id.to_string(),
            branch_id: branch_id.to_string(),
            cache: Mutex::new(Cache { last }),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn branch_id(&self) -> &str {
        &self.branch_id
    }

    /// Append one message, filling `parent_message_id` from the cache and
    /// relinking the parent's `chosen_next_id` in the same transaction as
    /// the insert. Attachments carrying raw bytes are hashed into the blob
    /// store first; only the resulting descriptor is ever persisted.
    #[instrument(skip(self, fields, attachments))]
    pub fn add(&self, fields: ChainAppend, attachments: Vec<AttachmentInput>) -> Result<Message> {
        let resolved = self.resolve_attachments(attachments)?;

        let parent = {
            let cache = self.cache.lock().unwrap();
            cache.last
        };

        let new_msg = NewMessage {
            text: fields.text,
            msg_type: Some(fields.msg_type),
            attachments: resolved,
            model: fields.model,
            generation: fields.generation,
            state: fields.state,
            aux: fields.aux,
        };

        let message = self
            .store
            .append_message(&self.session_id, &self.branch_id, parent, new_msg)?;

        let mut cache = self.cache.lock().unwrap();
        cache.last = Some(message.id);
        Ok(message)
    }

    /// Force the cache's notion of "last message" — used when the chain
    /// is reused after an external rewiring of `chosen_next_id` (branch
    /// switch, retry) so the next `add` parents correctly.
    pub fn set_cursor(&self, last: Option<i64>) {
        self.cache.lock().unwrap().last = last;
    }

    pub fn cursor(&self) -> Option<i64> {
        self.cache.lock().unwrap().last
    }

    fn resolve_attachments(
        &self,
        attachments: Vec<AttachmentInput>,
    ) -> Result<Vec<convo_core::types::Attachment>> {
        let mut out = Vec::with_capacity(attachments.len());
        for att in attachments {
            let resolved = match att {
                AttachmentInput::Bytes {
                    name,
                    mime_type,
                    bytes,
                } => {
                    let hash = self.store.save_blob(&bytes)?;
                    convo_core::types::Attachment {
                        name,
                        mime_type,
                        hash,
                        omitted: false,
                    }
                }
                AttachmentInput::Hash {
                    name,
                    mime_type,
                    hash,
                } => convo_core::types::Attachment {
                    name,
                    mime_type,
                    hash,
                    omitted: false,
                },
            };
            out.push(resolved);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convo_core::types::MessageType;
    use rusqlite::Connection;

    fn store() -> Arc<MessageStore> {
        let conn = Connection::open_in_memory().unwrap();
        convo_store::db::init_db(&conn).unwrap();
        Arc::new(MessageStore::new(conn))
    }

    #[test]
    fn add_chains_parent_and_chosen_next_id() {
        let store = store();
        let (session, branch) = store.create_session("", "sp", "ws").unwrap();
        let chain = MessageChain::open(store.clone(), &session.id, &branch.id).unwrap();

        let user = chain
            .add(ChainAppend::new(MessageType::UserText, "hi"), vec![])
            .unwrap();
        let model = chain
            .add(ChainAppend::new(MessageType::ModelText, "hello"), vec![])
            .unwrap();

        assert_eq!(model.parent_message_id, Some(user.id));
        let refetched_user = store.fetch_message(user.id).unwrap();
        assert_eq!(refetched_user.chosen_next_id, Some(model.id));
    }

    #[test]
    fn attachment_bytes_are_hashed_not_inlined() {
        let store = store();
        let (session, branch) = store.create_session("", "sp", "ws").unwrap();
        let chain = MessageChain::open(store.clone(), &session.id, &branch.id).unwrap();

        let msg = chain
            .add(
                ChainAppend::new(MessageType::UserText, "see attached"),
                vec![AttachmentInput::Bytes {
                    name: "a.png".into(),
                    mime_type: "image/png".into(),
                    bytes: b"fake-png-bytes".to_vec(),
                }],
            )
            .unwrap();

        assert_eq!(msg.attachments.len(), 1);
        let hash = &msg.attachments[0].hash;
        assert_eq!(store.load_blob(hash).unwrap().unwrap(), b"fake-png-bytes");
    }

    #[test]
    fn open_seeds_cursor_from_existing_branch_head() {
        let store = store();
        let (session, branch) = store.create_session("", "sp", "ws").unwrap();
        {
            let chain = MessageChain::open(store.clone(), &session.id, &branch.id).unwrap();
            chain
                .add(ChainAppend::new(MessageType::UserText, "hi"), vec![])
                .unwrap();
        }
        let chain2 = MessageChain::open(store.clone(), &session.id, &branch.id).unwrap();
        let next = chain2
            .add(ChainAppend::new(MessageType::ModelText, "hello"), vec![])
            .unwrap();
        assert!(next.parent_message_id.is_some());
    }
}
