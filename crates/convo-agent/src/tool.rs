use async_trait::async_trait;
use serde_json::Value;

/// Outcome of dispatching a tool call.
#[derive(Debug, Clone)]
pub enum ToolOutcome {
    /// The call ran to completion; the payload becomes the
    /// `function_response` content.
    Success(Value),
    /// The call failed in a way the model should see and can react to
    /// (§7 "Tool" — recoverable).
    Error(Value),
    /// The dispatcher needs explicit user approval before running this
    /// call. `data` is an opaque, dispatcher-supplied description shown to
    /// the user (§6 event `P`).
    PendingConfirmation { data: Value },
}

/// One tool definition the provider is told about.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// External collaborator that actually runs tool calls (file I/O, web
/// fetch, code execution, ...). The core only defines this interface and
/// ships test doubles — never a real dispatcher.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    /// List tool definitions currently available, to pass to the provider.
    fn available_tools(&self) -> Vec<ToolSpec>;

    /// Cheap capability check — does this dispatcher know `name` at all?
    fn has_tool(&self, name: &str) -> bool;

    /// Dispatch a call. May return `PendingConfirmation` instead of
    /// running it.
    async fn dispatch(&self, name: &str, args: &Value) -> ToolOutcome;

    /// Re-dispatch a previously pending call after the user approved it,
    /// with possibly-modified arguments. Must not itself return
    /// `PendingConfirmation`.
    async fn dispatch_confirmed(&self, name: &str, args: &Value) -> ToolOutcome;
}

/// Reserved tool name for the synthetic `function_call`/`function_response`
/// pair the History Assembler manufactures for `system_prompt`/
/// `env_changed` messages (§4.2 rule 7).
pub const TOOL_NEW_SYSTEM_PROMPT: &str = "new_system_prompt";

/// Reserved tool name for model-generated executable code (§4.6, §9).
pub const TOOL_EXECUTE_CODE: &str = "execute_code";
