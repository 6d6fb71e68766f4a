use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use convo_chain::{AttachmentInput, ChainAppend, MessageChain};
use convo_core::types::MessageType;
use convo_history::{curated_context, CuratedItem};
use convo_hub::{Event, SseHub};
use convo_registry::CallRegistry;
use convo_store::MessageStore;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::error::{OrchestratorError, Result};
use crate::part::ResponsePart;
use crate::provider::{ChatRequest, LlmProvider, Message as ProviderMessage, Role};
use crate::tool::{ToolDispatcher, ToolOutcome, TOOL_EXECUTE_CODE, TOOL_NEW_SYSTEM_PROMPT};

/// Channel depth between a provider's `send_stream` task and the
/// orchestrator's consumption loop; the provider is expected to produce
/// parts far slower than this drains.
const PART_BUFFER: usize = 64;

/// Prompt used for the post-completion session-name inference call (§4.6).
/// Capped in `infer_session_name` at 100 characters, single line.
const NAME_INFERENCE_PROMPT: &str =
    "Summarize this conversation in a short title of five words or fewer. \
     Respond with the title only, no quotes or punctuation at the end.";

/// Outcome of driving one turn to its terminus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Complete,
    PendingConfirmation,
    Canceled,
    Failed,
}

/// Everything identifying the turn being driven. `user_message_id` is the
/// message whose `cumul_token_count` receives the prompt-token usage.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub session_id: String,
    pub branch_id: String,
    pub model: String,
    pub system_prompt: String,
    pub generation: i64,
    pub user_message_id: i64,
}

/// Drives assistant turns: one streamed provider response per loop
/// iteration, persisting every event to the message chain and
/// broadcasting it to the SSE Hub as it happens (§4.6).
pub struct Orchestrator {
    store: Arc<MessageStore>,
    hub: Arc<SseHub>,
    registry: Arc<CallRegistry>,
    provider: Arc<dyn LlmProvider>,
    dispatcher: Arc<dyn ToolDispatcher>,
    max_tool_iterations: u32,
    name_inference_deadline_secs: u64,
}

/// Tracks the in-flight `model_text` run (if any) across parts of a
/// single provider response.
struct RunState {
    open_model_text: Option<i64>,
    last_model_text: Option<i64>,
}

impl RunState {
    fn new() -> Self {
        Self {
            open_model_text: None,
            last_model_text: None,
        }
    }
}

impl Orchestrator {
    pub fn new(
        store: Arc<MessageStore>,
        hub: Arc<SseHub>,
        registry: Arc<CallRegistry>,
        provider: Arc<dyn LlmProvider>,
        dispatcher: Arc<dyn ToolDispatcher>,
        max_tool_iterations: u32,
    ) -> Self {
        Self::with_name_inference_deadline(
            store,
            hub,
            registry,
            provider,
            dispatcher,
            max_tool_iterations,
            60,
        )
    }

    pub fn with_name_inference_deadline(
        store: Arc<MessageStore>,
        hub: Arc<SseHub>,
        registry: Arc<CallRegistry>,
        provider: Arc<dyn LlmProvider>,
        dispatcher: Arc<dyn ToolDispatcher>,
        max_tool_iterations: u32,
        name_inference_deadline_secs: u64,
    ) -> Self {
        Self {
            store,
            hub,
            registry,
            provider,
            dispatcher,
            max_tool_iterations,
            name_inference_deadline_secs,
        }
    }

    fn emit(&self, session_id: &str, code: char, payload: impl Into<String>) {
        self.hub.broadcast(session_id, Event::new(code, payload));
    }

    /// Start a fresh turn: assemble curated history for `req.branch_id`
    /// and drive the tool-calling loop from scratch.
    #[instrument(skip(self, req, cancel))]
    pub async fn run_turn(&self, req: TurnRequest, cancel: CancellationToken) -> Result<TurnOutcome> {
        let chain = Arc::new(MessageChain::open(
            self.store.clone(),
            &req.session_id,
            &req.branch_id,
        )?);
        let curated = curated_context(&self.store, &req.branch_id)?;
        let seed_messages = curated_to_provider_messages(&curated);
        self.drive(req, chain, seed_messages, cancel).await
    }

    /// Resume a paused turn (after a tool confirmation, or a retry) with
    /// an already-open chain and a seed context the caller assembled.
    #[instrument(skip(self, req, chain, seed_messages, cancel))]
    pub async fn resume_turn(
        &self,
        req: TurnRequest,
        chain: Arc<MessageChain>,
        seed_messages: Vec<ProviderMessage>,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome> {
        self.drive(req, chain, seed_messages, cancel).await
    }

    async fn drive(
        &self,
        req: TurnRequest,
        chain: Arc<MessageChain>,
        mut messages: Vec<ProviderMessage>,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome> {
        let tools = self.dispatcher.available_tools();
        let tool_defs = tools
            .into_iter()
            .map(|t| crate::provider::ToolDefinition {
                name: t.name,
                description: t.description,
                input_schema: t.input_schema,
            })
            .collect::<Vec<_>>();

        // Resets per streaming turn (§4.6), not per provider response, so
        // it survives across tool-loop iterations within this call.
        let image_counter = AtomicU32::new(0);

        let mut iterations = 0u32;
        loop {
            if cancel.is_cancelled() {
                return self.handle_cancel(&req, &chain, None);
            }
            if iterations >= self.max_tool_iterations {
                warn!(session_id = %req.session_id, "tool iteration cap reached");
                return self.handle_complete(&req, &chain, None).await;
            }
            iterations += 1;

            let request = ChatRequest {
                model: req.model.clone(),
                system: req.system_prompt.clone(),
                messages: messages.clone(),
                raw_messages: None,
                max_tokens: 8192,
                tools: tool_defs.clone(),
            };

            let (tx, mut rx) = mpsc::channel::<ResponsePart>(PART_BUFFER);
            let provider = self.provider.clone();
            let send_task = tokio::spawn(async move { provider.send_stream(&request, tx).await });

            let mut run = RunState::new();
            let mut did_call_tool = false;
            let mut outcome: Option<TurnOutcome> = None;

            'parts: loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        outcome = Some(self.handle_cancel(&req, &chain, run.open_model_text)?);
                        break 'parts;
                    }
                    part = rx.recv() => {
                        let Some(part) = part else { break 'parts; };
                        match self.handle_part(&req, &chain, &mut run, &image_counter, part).await? {
                            PartEffect::Continue => {}
                            PartEffect::CallMade { function_call, function_response } => {
                                did_call_tool = true;
                                messages.push(function_call);
                                messages.push(function_response);
                            }
                            PartEffect::PendingConfirmation => {
                                outcome = Some(TurnOutcome::PendingConfirmation);
                                break 'parts;
                            }
                            PartEffect::Failed => {
                                outcome = Some(self.handle_failure(&req, &chain, run.open_model_text, "provider error")?);
                                break 'parts;
                            }
                            PartEffect::Usage { prompt_tokens, total_tokens } => {
                                self.record_usage(&req, &run, prompt_tokens, total_tokens)?;
                            }
                        }
                    }
                }
            }

            // The provider task may still be mid-send on a full channel;
            // nothing will drain `rx` once we stop polling it below, so
            // wait on the task only after dropping the receiver (or it
            // would block forever on a cancel, per §9).
            if outcome.is_some() {
                drop(rx);
                send_task.abort();
            } else {
                let _ = send_task.await;
            }

            if let Some(outcome) = outcome {
                return Ok(outcome);
            }

            if did_call_tool {
                continue;
            }

            return self.handle_complete(&req, &chain, run.open_model_text.or(run.last_model_text)).await;
        }
    }

    /// Resume a turn paused on `pending_confirmation` (§4.7 "Confirm (or
    /// deny) pending tool"). On denial, persists the canned denial
    /// response and completes without touching the provider. On approval,
    /// re-dispatches with `dispatch_confirmed` and folds the result back
    /// into the working context before resuming the tool-calling loop.
    #[instrument(skip(self, req, chain, args, cancel))]
    pub async fn resume_after_confirmation(
        &self,
        req: TurnRequest,
        chain: Arc<MessageChain>,
        tool_name: &str,
        args: Value,
        approved: bool,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome> {
        self.store.set_pending_confirmation(&req.branch_id, None)?;

        if !approved {
            let response_text = json!({ "error": "User denied tool execution" }).to_string();
            let msg = chain.add(ChainAppend::new(MessageType::FunctionResponse, response_text.clone()), vec![])?;
            self.emit(&req.session_id, 'R', format!("{}\n{}\n{}", msg.id, tool_name, response_text));
            self.emit(&req.session_id, 'X', "");
            self.registry.complete(&req.session_id).ok();
            return Ok(TurnOutcome::Complete);
        }

        let outcome = self.dispatcher.dispatch_confirmed(tool_name, &args).await;
        let value = match outcome {
            ToolOutcome::Success(v) | ToolOutcome::Error(v) => v,
            ToolOutcome::PendingConfirmation { .. } => {
                warn!(session_id = %req.session_id, "dispatch_confirmed deferred again; treating as error");
                json!({ "error": "tool deferred confirmation a second time" })
            }
        };
        let effect = self.finish_function_response(&req, &chain, 0, "", tool_name, value)?;
        let (function_call, function_response) = match effect {
            PartEffect::CallMade { function_call, function_response } => (function_call, function_response),
            _ => unreachable!("finish_function_response always returns CallMade"),
        };

        let curated = curated_context(&self.store, &req.branch_id)?;
        let mut seed = curated_to_provider_messages(&curated);
        seed.push(function_call);
        seed.push(function_response);
        self.drive(req, chain, seed, cancel).await
    }

    async fn handle_part(
        &self,
        req: &TurnRequest,
        chain: &MessageChain,
        run: &mut RunState,
        image_counter: &AtomicU32,
        part: ResponsePart,
    ) -> Result<PartEffect> {
        match part {
            ResponsePart::TextDelta { text } => {
                self.handle_text_delta(req, chain, run, &text)?;
                Ok(PartEffect::Continue)
            }
            ResponsePart::Thought { text } => {
                self.close_model_text_run(chain, run)?;
                let (header, body) = parse_thought(&text);
                let persisted = format!("**{header}**\n{body}");
                let msg = chain.add(ChainAppend::new(MessageType::Thought, persisted), vec![])?;
                self.emit(&req.session_id, 'T', format!("{}\n{header}\n{body}", msg.id));
                Ok(PartEffect::Continue)
            }
            ResponsePart::FunctionCall { id, name, args } => {
                self.close_model_text_run(chain, run)?;
                let call_text = json!({ "name": name, "args": args }).to_string();
                let call_msg = chain.add(ChainAppend::new(MessageType::FunctionCall, call_text.clone()), vec![])?;
                self.emit(&req.session_id, 'F', format!("{}\n{}\n{}", call_msg.id, name, args));

                let outcome = self.dispatcher.dispatch(&name, &args).await;
                match outcome {
                    ToolOutcome::PendingConfirmation { data } => {
                        let payload = json!({
                            "tool_name": name,
                            "arguments": args,
                            "data": data,
                        })
                        .to_string();
                        self.store.set_pending_confirmation(&req.branch_id, Some(&payload))?;
                        self.emit(&req.session_id, 'P', payload);
                        Ok(PartEffect::PendingConfirmation)
                    }
                    ToolOutcome::Success(value) => {
                        self.finish_function_response(req, chain, call_msg.id, &id, &name, value)
                    }
                    ToolOutcome::Error(value) => {
                        self.finish_function_response(req, chain, call_msg.id, &id, &name, value)
                    }
                }
            }
            ResponsePart::InlineData { mime_type, bytes } => {
                let n = image_counter.fetch_add(1, Ordering::SeqCst) + 1;
                let ext = extension_for_mime(&mime_type);
                let filename = format!("generated_image_{n:03}.{ext}");
                let msg = chain.add(
                    ChainAppend::new(MessageType::ModelText, ""),
                    vec![AttachmentInput::Bytes {
                        name: filename.clone(),
                        mime_type: mime_type.clone(),
                        bytes,
                    }],
                )?;
                let hash = msg.attachments.first().map(|a| a.hash.clone()).unwrap_or_default();
                let _ = &filename;
                self.emit(
                    &req.session_id,
                    'D',
                    json!({ "messageId": msg.id, "mimeType": mime_type, "hash": hash }).to_string(),
                );
                Ok(PartEffect::Continue)
            }
            ResponsePart::ExecutableCode { language, code } => {
                self.close_model_text_run(chain, run)?;
                let call_text = json!({ "name": TOOL_EXECUTE_CODE, "args": { "language": language, "code": code } })
                    .to_string();
                let msg = chain.add(ChainAppend::new(MessageType::FunctionCall, call_text), vec![])?;
                self.emit(&req.session_id, 'F', format!("{}\n{}\n{{\"language\":\"{language}\"}}", msg.id, TOOL_EXECUTE_CODE));
                Ok(PartEffect::Continue)
            }
            ResponsePart::CodeExecutionResult { outcome, output } => {
                let response_text = json!({ "outcome": outcome, "output": output }).to_string();
                let msg = chain.add(ChainAppend::new(MessageType::FunctionResponse, response_text.clone()), vec![])?;
                self.emit(&req.session_id, 'R', format!("{}\n{}\n{}", msg.id, TOOL_EXECUTE_CODE, response_text));
                Ok(PartEffect::Continue)
            }
            ResponsePart::Usage { prompt_tokens, total_tokens } => {
                Ok(PartEffect::Usage { prompt_tokens, total_tokens })
            }
            ResponsePart::Done => Ok(PartEffect::Continue),
            ResponsePart::Error { message } => {
                warn!(session_id = %req.session_id, error = %message, "provider reported an error part");
                Ok(PartEffect::Failed)
            }
        }
    }

    fn handle_text_delta(
        &self,
        req: &TurnRequest,
        chain: &MessageChain,
        run: &mut RunState,
        text: &str,
    ) -> Result<()> {
        match run.open_model_text {
            None => {
                let state = format!("{},", text.len());
                let mut fields = ChainAppend::new(MessageType::ModelText, "");
                fields.model = Some(req.model.clone());
                fields.generation = req.generation;
                fields.state = Some(state);
                let msg = chain.add(fields, vec![])?;
                self.store.append_text(msg.id, text)?;
                run.open_model_text = Some(msg.id);
                self.emit(&req.session_id, 'M', format!("{}\n{text}", msg.id));
            }
            Some(id) => {
                self.store.append_text(id, text)?;
                self.emit(&req.session_id, 'M', format!("{id}\n{text}"));
            }
        }
        Ok(())
    }

    fn close_model_text_run(&self, chain: &MessageChain, run: &mut RunState) -> Result<()> {
        if let Some(id) = run.open_model_text.take() {
            let msg = self.store.fetch_message(id)?;
            self.store.finalize_text(id, &msg.text)?;
            run.last_model_text = Some(id);
        }
        let _ = chain;
        Ok(())
    }

    fn finish_function_response(
        &self,
        req: &TurnRequest,
        chain: &MessageChain,
        call_id: i64,
        _provider_call_id: &str,
        name: &str,
        value: Value,
    ) -> Result<PartEffect> {
        let _ = call_id;
        let response_text = value.to_string();
        let response_msg = chain.add(ChainAppend::new(MessageType::FunctionResponse, response_text.clone()), vec![])?;
        self.emit(&req.session_id, 'R', format!("{}\n{}\n{}", response_msg.id, name, response_text));

        let call_msg = ProviderMessage {
            role: Role::Assistant,
            content: json!({ "function_call": { "name": name } }).to_string(),
        };
        let response_msg_repr = ProviderMessage {
            role: Role::User,
            content: response_text,
        };
        Ok(PartEffect::CallMade {
            function_call: call_msg,
            function_response: response_msg_repr,
        })
    }

    fn record_usage(&self, req: &TurnRequest, run: &RunState, prompt_tokens: u32, total_tokens: u32) -> Result<()> {
        self.store.update_token_count(req.user_message_id, prompt_tokens as i64)?;
        self.emit(&req.session_id, 'C', format!("{}\n{prompt_tokens}", req.user_message_id));
        if let Some(model_id) = run.open_model_text.or(run.last_model_text) {
            self.store.update_token_count(model_id, total_tokens as i64)?;
            self.emit(&req.session_id, 'C', format!("{model_id}\n{total_tokens}"));
        }
        Ok(())
    }

    fn handle_cancel(&self, req: &TurnRequest, chain: &MessageChain, open_model_text: Option<i64>) -> Result<TurnOutcome> {
        if let Some(id) = open_model_text {
            let msg = self.store.fetch_message(id)?;
            self.store.finalize_text(id, &msg.text)?;
        }
        chain.add(ChainAppend::new(MessageType::ModelError, "user canceled request"), vec![])?;
        self.emit(&req.session_id, 'E', "user canceled request");
        self.registry.mark_canceled(&req.session_id).ok();
        Ok(TurnOutcome::Canceled)
    }

    fn handle_failure(
        &self,
        req: &TurnRequest,
        chain: &MessageChain,
        open_model_text: Option<i64>,
        message: &str,
    ) -> Result<TurnOutcome> {
        match open_model_text {
            Some(id) => {
                let msg = self.store.fetch_message(id)?;
                let text = format!("{}\n[error: {message}]", msg.text);
                self.store.finalize_text(id, &text)?;
            }
            None => {
                chain.add(ChainAppend::new(MessageType::ModelError, message), vec![])?;
            }
        }
        self.emit(&req.session_id, 'E', message);
        self.registry.fail(&req.session_id).ok();
        Ok(TurnOutcome::Failed)
    }

    /// Clean loop exit: finalize the trailing `model_text` run, broadcast
    /// completion, and (best-effort) infer a session name.
    async fn handle_complete(
        &self,
        req: &TurnRequest,
        chain: &MessageChain,
        last_model_text: Option<i64>,
    ) -> Result<TurnOutcome> {
        if let Some(id) = last_model_text {
            let msg = self.store.fetch_message(id)?;
            if !msg.indexed {
                self.store.finalize_text(id, &msg.text)?;
            }
        }
        self.emit(&req.session_id, 'X', "");
        self.registry.complete(&req.session_id).ok();

        let session = self.store.fetch_session(&req.session_id)?;
        if session.name.is_empty() {
            self.try_infer_session_name(req).await;
        }
        let _ = chain;
        Ok(TurnOutcome::Complete)
    }

    /// Best-effort: a second, non-streaming-in-spirit provider call with a
    /// fixed prompt, capped at 100 characters, single line. Failures are
    /// swallowed — a missing session name is cosmetic, never fatal.
    async fn try_infer_session_name(&self, req: &TurnRequest) {
        let deadline = std::time::Duration::from_secs(self.name_inference_deadline_secs);
        let attempt = tokio::time::timeout(deadline, self.infer_session_name(req)).await;
        match attempt {
            Ok(Ok(name)) => {
                if let Err(e) = self.apply_session_name(&req.session_id, &name) {
                    warn!(session_id = %req.session_id, error = %e, "failed to persist inferred session name");
                }
            }
            Ok(Err(e)) => warn!(session_id = %req.session_id, error = %e, "session name inference failed"),
            Err(_) => warn!(session_id = %req.session_id, "session name inference timed out"),
        }
    }

    async fn infer_session_name(&self, req: &TurnRequest) -> Result<String> {
        let history = curated_context(&self.store, &req.branch_id)?;
        let mut messages = curated_to_provider_messages(&history);
        messages.push(ProviderMessage {
            role: Role::User,
            content: NAME_INFERENCE_PROMPT.to_string(),
        });
        let request = ChatRequest {
            model: req.model.clone(),
            system: String::new(),
            messages,
            raw_messages: None,
            max_tokens: 32,
            tools: vec![],
        };
        let (tx, mut rx) = mpsc::channel::<ResponsePart>(PART_BUFFER);
        self.provider.send_stream(&request, tx).await?;
        let mut name = String::new();
        while let Some(part) = rx.recv().await {
            if let ResponsePart::TextDelta { text } = part {
                name.push_str(&text);
            }
        }
        let name = name.trim().lines().next().unwrap_or("").to_string();
        let capped: String = name.chars().take(100).collect();
        Ok(capped)
    }

    fn apply_session_name(&self, session_id: &str, name: &str) -> Result<()> {
        if name.is_empty() {
            return Ok(());
        }
        self.store.rename_session(session_id, name)?;
        self.emit(session_id, 'N', format!("{session_id}\n{name}"));
        info!(session_id, name, "inferred session name");
        Ok(())
    }
}

enum PartEffect {
    Continue,
    CallMade {
        function_call: ProviderMessage,
        function_response: ProviderMessage,
    },
    PendingConfirmation,
    Failed,
    Usage { prompt_tokens: u32, total_tokens: u32 },
}

fn parse_thought(text: &str) -> (String, String) {
    if let Some(rest) = text.strip_prefix("**") {
        if let Some(end) = rest.find("**") {
            let header = rest[..end].to_string();
            let body = rest[end + 2..].trim_start_matches('\n').to_string();
            return (header, body);
        }
    }
    ("Thinking...".to_string(), text.to_string())
}

fn extension_for_mime(mime_type: &str) -> &'static str {
    match mime_type {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "bin",
    }
}

/// Flatten curated history into the flat `(role, content)` shape the
/// provider trait accepts. A `system_prompt`/`env_changed` expansion
/// becomes the synthetic `new_system_prompt` function-call pair the
/// History Assembler's rule 7 describes.
pub fn curated_to_provider_messages(items: &[CuratedItem]) -> Vec<ProviderMessage> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match item {
            CuratedItem::Raw(h) => {
                let role = match h.message.msg_type {
                    MessageType::UserText | MessageType::FunctionResponse => Role::User,
                    MessageType::Compression => Role::System,
                    _ => Role::Assistant,
                };
                out.push(ProviderMessage {
                    role,
                    content: h.message.text.clone(),
                });
            }
            CuratedItem::SystemPromptExpansion { prompt_text, .. } => {
                out.push(ProviderMessage {
                    role: Role::Assistant,
                    content: json!({ "function_call": { "name": TOOL_NEW_SYSTEM_PROMPT } }).to_string(),
                });
                out.push(ProviderMessage {
                    role: Role::User,
                    content: prompt_text.clone(),
                });
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderError;
    use async_trait::async_trait;
    use convo_store::types::NewMessage;
    use rusqlite::Connection;
    use std::sync::atomic::AtomicBool;

    fn store() -> Arc<MessageStore> {
        let conn = Connection::open_in_memory().unwrap();
        convo_store::db::init_db(&conn).unwrap();
        Arc::new(MessageStore::new(conn))
    }

    struct ScriptedProvider {
        parts: Vec<ResponsePart>,
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn send_stream(
            &self,
            _req: &ChatRequest,
            tx: mpsc::Sender<ResponsePart>,
        ) -> std::result::Result<(), ProviderError> {
            for part in self.parts.clone() {
                if tx.send(part).await.is_err() {
                    break;
                }
            }
            Ok(())
        }
    }

    struct NoTools;

    #[async_trait]
    impl ToolDispatcher for NoTools {
        fn available_tools(&self) -> Vec<crate::tool::ToolSpec> {
            vec![]
        }
        fn has_tool(&self, _name: &str) -> bool {
            false
        }
        async fn dispatch(&self, _name: &str, _args: &Value) -> ToolOutcome {
            ToolOutcome::Error(json!({ "error": "no tools registered" }))
        }
        async fn dispatch_confirmed(&self, _name: &str, _args: &Value) -> ToolOutcome {
            ToolOutcome::Error(json!({ "error": "no tools registered" }))
        }
    }

    struct EchoTool {
        called: AtomicBool,
    }

    #[async_trait]
    impl ToolDispatcher for EchoTool {
        fn available_tools(&self) -> Vec<crate::tool::ToolSpec> {
            vec![crate::tool::ToolSpec {
                name: "echo".into(),
                description: "echoes input".into(),
                input_schema: json!({}),
            }]
        }
        fn has_tool(&self, name: &str) -> bool {
            name == "echo"
        }
        async fn dispatch(&self, _name: &str, args: &Value) -> ToolOutcome {
            self.called.store(true, Ordering::SeqCst);
            ToolOutcome::Success(args.clone())
        }
        async fn dispatch_confirmed(&self, _name: &str, args: &Value) -> ToolOutcome {
            ToolOutcome::Success(args.clone())
        }
    }

    fn seed_turn(store: &Arc<MessageStore>) -> (String, String, i64) {
        let (session, branch) = store.create_session("", "be terse", "ws").unwrap();
        let user = store
            .append_message(&session.id, &branch.id, None, NewMessage::new(MessageType::UserText, "hi"))
            .unwrap();
        (session.id, branch.id, user.id)
    }

    #[tokio::test]
    async fn simple_turn_persists_model_text_and_completes() {
        let store = store();
        let (session_id, branch_id, user_id) = seed_turn(&store);
        let hub = Arc::new(SseHub::new());
        let registry = Arc::new(CallRegistry::new());
        let provider = Arc::new(ScriptedProvider {
            parts: vec![
                ResponsePart::TextDelta { text: "hello".into() },
                ResponsePart::TextDelta { text: " there".into() },
                ResponsePart::Done,
            ],
        });
        let orch = Orchestrator::new(store.clone(), hub, registry.clone(), provider, Arc::new(NoTools), 25);
        registry.start(&session_id, CancellationToken::new()).unwrap();

        let req = TurnRequest {
            session_id: session_id.clone(),
            branch_id: branch_id.clone(),
            model: "test-model".into(),
            system_prompt: "be terse".into(),
            generation: 0,
            user_message_id: user_id,
        };
        let outcome = orch.run_turn(req, CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, TurnOutcome::Complete);

        let latest = store.latest_message_in_branch(&branch_id).unwrap().unwrap();
        assert_eq!(latest.msg_type, MessageType::ModelText);
        assert_eq!(latest.text, "hello there");
        assert!(latest.indexed);
    }

    #[tokio::test]
    async fn tool_call_loop_persists_call_and_response_then_completes() {
        let store = store();
        let (session_id, branch_id, user_id) = seed_turn(&store);
        let hub = Arc::new(SseHub::new());
        let registry = Arc::new(CallRegistry::new());
        let provider = Arc::new(ScriptedProvider {
            parts: vec![
                ResponsePart::FunctionCall {
                    id: "call-1".into(),
                    name: "echo".into(),
                    args: json!({ "x": 1 }),
                },
                ResponsePart::Done,
            ],
        });
        let dispatcher = Arc::new(EchoTool { called: AtomicBool::new(false) });
        let orch = Orchestrator::new(store.clone(), hub, registry.clone(), provider, dispatcher.clone(), 1);
        registry.start(&session_id, CancellationToken::new()).unwrap();

        let req = TurnRequest {
            session_id,
            branch_id: branch_id.clone(),
            model: "test-model".into(),
            system_prompt: String::new(),
            generation: 0,
            user_message_id: user_id,
        };
        let outcome = orch.run_turn(req, CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, TurnOutcome::Complete);
        assert!(dispatcher.called.load(Ordering::SeqCst));

        let messages = store.messages_in_branch(&branch_id).unwrap();
        assert!(messages.iter().any(|m| m.msg_type == MessageType::FunctionCall));
        assert!(messages.iter().any(|m| m.msg_type == MessageType::FunctionResponse));
    }

    #[tokio::test]
    async fn pending_confirmation_pauses_the_turn() {
        struct ConfirmTool;
        #[async_trait]
        impl ToolDispatcher for ConfirmTool {
            fn available_tools(&self) -> Vec<crate::tool::ToolSpec> {
                vec![]
            }
            fn has_tool(&self, _name: &str) -> bool {
                true
            }
            async fn dispatch(&self, _name: &str, _args: &Value) -> ToolOutcome {
                ToolOutcome::PendingConfirmation { data: json!({ "risk": "deletes a file" }) }
            }
            async fn dispatch_confirmed(&self, _name: &str, args: &Value) -> ToolOutcome {
                ToolOutcome::Success(args.clone())
            }
        }

        let store = store();
        let (session_id, branch_id, user_id) = seed_turn(&store);
        let hub = Arc::new(SseHub::new());
        let registry = Arc::new(CallRegistry::new());
        let provider = Arc::new(ScriptedProvider {
            parts: vec![ResponsePart::FunctionCall {
                id: "call-1".into(),
                name: "delete_file".into(),
                args: json!({ "path": "/tmp/x" }),
            }],
        });
        let orch = Orchestrator::new(store.clone(), hub, registry.clone(), provider, Arc::new(ConfirmTool), 25);
        registry.start(&session_id, CancellationToken::new()).unwrap();

        let req = TurnRequest {
            session_id,
            branch_id: branch_id.clone(),
            model: "test-model".into(),
            system_prompt: String::new(),
            generation: 0,
            user_message_id: user_id,
        };
        let outcome = orch.run_turn(req, CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, TurnOutcome::PendingConfirmation);

        let branch = store.fetch_branch(&branch_id).unwrap();
        assert!(branch.pending_confirmation.is_some());
    }

    #[tokio::test]
    async fn cancel_before_first_request_persists_model_error_and_cancels() {
        let store = store();
        let (session_id, branch_id, user_id) = seed_turn(&store);
        let hub = Arc::new(SseHub::new());
        let registry = Arc::new(CallRegistry::new());
        let provider = Arc::new(ScriptedProvider {
            parts: vec![ResponsePart::TextDelta { text: "should not be seen".into() }],
        });
        let orch = Orchestrator::new(store.clone(), hub, registry.clone(), provider, Arc::new(NoTools), 25);
        registry.start(&session_id, CancellationToken::new()).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let req = TurnRequest {
            session_id,
            branch_id: branch_id.clone(),
            model: "test-model".into(),
            system_prompt: String::new(),
            generation: 0,
            user_message_id: user_id,
        };
        let outcome = orch.run_turn(req, cancel).await.unwrap();
        assert_eq!(outcome, TurnOutcome::Canceled);

        let latest = store.latest_message_in_branch(&branch_id).unwrap().unwrap();
        assert_eq!(latest.msg_type, MessageType::ModelError);
        assert_eq!(latest.text, "user canceled request");
    }
}
