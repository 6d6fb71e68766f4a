use serde_json::Value;

/// One classified piece of a streamed provider response, in the order the
/// provider produced it (§4.6 "per-part handling"). Generalizes the
/// content-block taxonomy real providers expose into the shape the
/// orchestrator dispatches on.
#[derive(Debug, Clone)]
pub enum ResponsePart {
    /// Ordinary model text, not a reasoning trace.
    TextDelta { text: String },
    /// A reasoning-trace fragment. Real providers emit these as a
    /// distinct content-block type; this crate treats the whole fragment
    /// as one part rather than streaming it incrementally.
    Thought { text: String },
    FunctionCall {
        id: String,
        name: String,
        args: Value,
    },
    /// Model-generated binary content (e.g. an image).
    InlineData { mime_type: String, bytes: Vec<u8> },
    ExecutableCode { language: String, code: String },
    CodeExecutionResult { outcome: String, output: String },
    /// Token usage for the turn so far.
    Usage { prompt_tokens: u32, total_tokens: u32 },
    /// The provider has nothing further to say for this response.
    Done,
    Error { message: String },
}
