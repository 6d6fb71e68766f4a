//! Placeholder `LlmProvider`/`ToolDispatcher` the binary wires in by
//! default. The session runtime's job stops at the provider/dispatcher
//! trait boundary (§1 non-goals: tokenization, HTTP calls, OAuth, and real
//! tool execution are external collaborators); a production deployment
//! swaps these for real adapters in `AppState::new` without touching
//! anything downstream of the traits.

use async_trait::async_trait;
use convo_agent::{ChatRequest, LlmProvider, ProviderError, ResponsePart, ToolDispatcher, ToolOutcome, ToolSpec};
use serde_json::{json, Value};
use tokio::sync::mpsc;

/// Echoes the last user message back as a single text part. Enough to
/// exercise the full turn/branch/SSE machinery end to end without a real
/// model behind it.
pub struct EchoProvider;

#[async_trait]
impl LlmProvider for EchoProvider {
    fn name(&self) -> &str {
        "stub-echo"
    }

    async fn send_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<ResponsePart>,
    ) -> Result<(), ProviderError> {
        let last_user = req
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, convo_agent::Role::User))
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let reply = format!("echo: {last_user}");
        let _ = tx
            .send(ResponsePart::TextDelta { text: reply })
            .await;
        let _ = tx.send(ResponsePart::Done).await;
        Ok(())
    }
}

/// No tools registered; any function call the stub provider never
/// produces would simply be reported as an error.
pub struct NoTools;

#[async_trait]
impl ToolDispatcher for NoTools {
    fn available_tools(&self) -> Vec<ToolSpec> {
        vec![]
    }

    fn has_tool(&self, _name: &str) -> bool {
        false
    }

    async fn dispatch(&self, name: &str, _args: &Value) -> ToolOutcome {
        ToolOutcome::Error(json!({ "error": format!("no dispatcher registered for tool '{name}'") }))
    }

    async fn dispatch_confirmed(&self, name: &str, _args: &Value) -> ToolOutcome {
        ToolOutcome::Error(json!({ "error": format!("no dispatcher registered for tool '{name}'") }))
    }
}
