use convo_core::types::MessageType;

/// An attachment supplied to `MessageChain::add`. Bytes are hashed into
/// the blob store before the message is persisted; only the resulting
/// descriptor (name, MIME type, hash) is ever written to the message row.
pub enum AttachmentInput {
    /// Fresh bytes that must be saved to the blob store.
    Bytes {
        name: String,
        mime_type: String,
        bytes: Vec<u8>,
    },
    /// A hash already known to the blob store (e.g. re-attaching a tool
    /// result that was hashed by the caller).
    Hash {
        name: String,
        mime_type: String,
        hash: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct ChainAppend {
    pub msg_type: MessageType,
    pub text: String,
    pub model: Option<String>,
    pub generation: i64,
    pub state: Option<String>,
    pub aux: Option<String>,
}

impl ChainAppend {
    pub fn new(msg_type: MessageType, text: impl Into<String>) -> Self {
        Self {
            msg_type,
            text: text.into(),
            ..Default::default()
        }
    }
}
