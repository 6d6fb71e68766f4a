use convo_core::types::Attachment;
use convo_history::HistoryMessage;
use serde::Serialize;
use serde_json::Value;

/// Wire shape for one history entry — §6's initial-state record embeds a
/// list of these as `history`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryMessageWire {
    pub id: i64,
    pub parent_message_id: Option<i64>,
    pub chosen_next_id: Option<i64>,
    pub text: String,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub attachments: Vec<Attachment>,
    pub cumul_token_count: Option<i64>,
    pub model: Option<String>,
    pub created_at: String,
    pub possible_next: Vec<i64>,
}

impl From<HistoryMessage> for HistoryMessageWire {
    fn from(h: HistoryMessage) -> Self {
        Self {
            id: h.message.id,
            parent_message_id: h.message.parent_message_id,
            chosen_next_id: h.message.chosen_next_id,
            text: h.message.text,
            msg_type: h.message.msg_type.as_str().to_string(),
            attachments: h.message.attachments,
            cumul_token_count: h.message.cumul_token_count,
            model: h.message.model,
            created_at: h.message.created_at,
            possible_next: h.possible_next,
        }
    }
}

/// §6's initial-state record, sent as the payload of the `I`/`J` event (or
/// returned verbatim as JSON for a plain `GET` without an SSE `Accept`).
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialState {
    pub session_id: String,
    pub history: Vec<HistoryMessageWire>,
    pub system_prompt: String,
    pub workspace_id: String,
    pub primary_branch_id: String,
    pub roots: Vec<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_elapsed_time_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_confirmation: Option<Value>,
}
