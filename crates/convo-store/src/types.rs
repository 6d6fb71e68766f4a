use convo_core::types::{Attachment, MessageType};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub system_prompt: String,
    pub workspace_id: String,
    pub primary_branch_id: String,
    pub chosen_first_id: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub id: String,
    pub session_id: String,
    pub parent_branch_id: Option<String>,
    pub branch_from_message_id: Option<i64>,
    pub created_at: String,
    /// Serialized `{"tool_name","arguments","data"}`, set while a tool call
    /// on this branch awaits user confirmation.
    pub pending_confirmation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub session_id: String,
    pub branch_id: String,
    pub parent_message_id: Option<i64>,
    pub chosen_next_id: Option<i64>,
    pub text: String,
    pub msg_type: MessageType,
    pub attachments: Vec<Attachment>,
    pub cumul_token_count: Option<i64>,
    pub model: Option<String>,
    pub generation: i64,
    pub state: Option<String>,
    pub aux: Option<String>,
    pub created_at: String,
    pub indexed: bool,
}

/// Fields supplied when appending a new message; identifiers and
/// bookkeeping columns are filled in by the store/chain.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub text: String,
    pub msg_type: Option<MessageType>,
    pub attachments: Vec<Attachment>,
    pub model: Option<String>,
    pub generation: i64,
    pub state: Option<String>,
    pub aux: Option<String>,
}

impl NewMessage {
    pub fn new(msg_type: MessageType, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            msg_type: Some(msg_type),
            ..Default::default()
        }
    }
}
