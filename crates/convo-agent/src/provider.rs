use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::part::ResponsePart;

/// A single message in the conversation history sent to the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Tool definition sent to the LLM API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Request to an LLM provider for one streamed response.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub messages: Vec<Message>,
    /// Structured content (tool_use / tool_result blocks) that can't be
    /// represented as plain-string `messages`; present once the tool loop
    /// has iterated at least once.
    pub raw_messages: Option<Vec<serde_json::Value>>,
    pub max_tokens: u32,
    pub tools: Vec<ToolDefinition>,
}

/// Common interface every LLM provider implements. The core ships no real
/// implementation — only this trait and test doubles.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name for logging and error messages.
    fn name(&self) -> &str;

    /// Stream one response through `tx`, classified into `ResponsePart`s in
    /// the order they were produced. Returns once the provider has sent its
    /// terminal `Done` or `Error` part (or the request was cancelled).
    async fn send_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<ResponsePart>,
    ) -> Result<(), ProviderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("operation cancelled")]
    Cancelled,
}
