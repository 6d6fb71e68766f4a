use convo_store::Message;

/// One message plus the "possible branches" hint: the identifiers of its
/// own children (`parent_message_id = this.id`), i.e. the alternative
/// continuations that exist alongside whichever one is currently chosen.
#[derive(Debug, Clone)]
pub struct HistoryMessage {
    pub message: Message,
    pub possible_next: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct PageRequest {
    /// 0 means "the most recent window".
    pub before_message_id: i64,
    pub limit: usize,
}

#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub messages: Vec<HistoryMessage>,
    pub has_more: bool,
}

/// One element of the curated, LLM-facing context. A `system_prompt` or
/// `env_changed` message expands into a synthetic pair rather than
/// passing through as itself (§4.2 rule 7).
#[derive(Debug, Clone)]
pub enum CuratedItem {
    Raw(HistoryMessage),
    SystemPromptExpansion {
        source_message_id: i64,
        prompt_text: String,
    },
}
