pub mod error;

use std::sync::Arc;

use convo_agent::{curated_to_provider_messages, Message as ProviderMessage, Orchestrator, TurnOutcome, TurnRequest};
use convo_chain::{ChainAppend, MessageChain};
use convo_core::types::MessageType;
use convo_history::{assemble_branch_chain, curated_context};
use convo_store::types::NewMessage;
use convo_store::{Branch, MessageStore};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

pub use error::BranchError;
use error::Result;

/// The four branch-level mutations that sit above the Message Chain
/// (§4.7): create, switch, confirm/deny a pending tool, retry an error.
/// All four ultimately hand off to the Streaming Orchestrator to resume
/// (or start) a turn.
pub struct BranchOps {
    store: Arc<MessageStore>,
    orchestrator: Arc<Orchestrator>,
}

impl BranchOps {
    pub fn new(store: Arc<MessageStore>, orchestrator: Arc<Orchestrator>) -> Self {
        Self { store, orchestrator }
    }

    /// Edit a `user_text` message, forking a new branch from it, and run
    /// the resulting turn to completion inline. Callers that must not let
    /// an HTTP client's disconnect cancel the turn (§5) should instead call
    /// [`Self::prepare_branch_creation`] and [`Self::run_prepared_turn`]
    /// separately, running the latter on a detached task.
    #[instrument(skip(self, replacement_text, cancel))]
    pub async fn create_branch(
        &self,
        session_id: &str,
        target_message_id: i64,
        replacement_text: &str,
        model: &str,
        cancel: CancellationToken,
    ) -> Result<(Branch, TurnOutcome)> {
        let (branch, chain, req, seed) =
            self.prepare_branch_creation(session_id, target_message_id, replacement_text, model)?;
        let outcome = self.run_prepared_turn(chain, req, seed, cancel).await?;
        Ok((branch, outcome))
    }

    /// The synchronous half of [`Self::create_branch`]: validates the
    /// target, forks the branch and its first message, rewires the
    /// session/parent pointers, and assembles the seed context for the
    /// turn — but does not talk to the provider. Returns everything
    /// [`Self::run_prepared_turn`] needs, so the caller can respond with
    /// the new branch's id before the (potentially long-running) turn
    /// starts.
    pub fn prepare_branch_creation(
        &self,
        session_id: &str,
        target_message_id: i64,
        replacement_text: &str,
        model: &str,
    ) -> Result<(Branch, Arc<MessageChain>, TurnRequest, Vec<ProviderMessage>)> {
        let target = self.store.fetch_message(target_message_id)?;
        if target.msg_type != MessageType::UserText {
            return Err(BranchError::NotUserText(target_message_id));
        }
        let session = self.store.fetch_session(session_id)?;

        let (branch, new_user_msg) = if session.chosen_first_id == Some(target.id) {
            let branch = self.store.create_branch(session_id, None, None)?;
            let msg = self.store.append_message(
                session_id,
                &branch.id,
                None,
                NewMessage::new(MessageType::UserText, replacement_text),
            )?;
            self.store.update_chosen_first_id(session_id, Some(msg.id))?;
            (branch, msg)
        } else {
            let parent_id = target
                .parent_message_id
                .ok_or(BranchError::RootEditMismatch(target_message_id))?;
            let branch = self
                .store
                .create_branch(session_id, Some(&target.branch_id), Some(parent_id))?;
            let msg = self.store.append_message(
                session_id,
                &branch.id,
                Some(parent_id),
                NewMessage::new(MessageType::UserText, replacement_text),
            )?;
            (branch, msg)
        };
        self.store.update_primary_branch(session_id, &branch.id)?;

        let chain = Arc::new(MessageChain::open(self.store.clone(), session_id, &branch.id)?);
        let curated = curated_context(&self.store, &branch.id)?;
        let seed = curated_to_provider_messages(&curated);
        let req = TurnRequest {
            session_id: session_id.to_string(),
            branch_id: branch.id.clone(),
            model: model.to_string(),
            system_prompt: session.system_prompt,
            generation: 0,
            user_message_id: new_user_msg.id,
        };
        Ok((branch, chain, req, seed))
    }

    /// The asynchronous half of [`Self::create_branch`]: resumes the
    /// streaming loop on an already-forked branch. Safe to run on a
    /// detached task after the branch id has already been returned to
    /// the caller.
    pub async fn run_prepared_turn(
        &self,
        chain: Arc<MessageChain>,
        req: TurnRequest,
        seed: Vec<ProviderMessage>,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome> {
        let outcome = self.orchestrator.resume_turn(req, chain, seed, cancel).await?;
        Ok(outcome)
    }

    /// Make `new_branch_id` primary, restoring the old primary's rewired
    /// `chosen_next_id` at its fork point and rewriting the new primary's
    /// fork point (or the session's `chosen_first_id`) to point at it.
    #[instrument(skip(self))]
    pub fn switch_branch(&self, session_id: &str, new_branch_id: &str) -> Result<()> {
        let session = self.store.fetch_session(session_id)?;
        if session.primary_branch_id == new_branch_id {
            return Ok(());
        }

        let old_branch = self.store.fetch_branch(&session.primary_branch_id)?;
        self.reset_old_primary_pointer(&old_branch)?;

        let new_branch = self.store.fetch_branch(new_branch_id)?;
        let own = self.store.messages_in_branch(new_branch_id)?;
        if let Some(first) = own.first() {
            match new_branch.branch_from_message_id {
                Some(fork_point) => {
                    self.store.update_chosen_next_id(fork_point, Some(first.id))?;
                }
                None => {
                    self.store.update_chosen_first_id(session_id, Some(first.id))?;
                }
            }
        }
        self.store.update_primary_branch(session_id, new_branch_id)?;
        Ok(())
    }

    fn reset_old_primary_pointer(&self, old_branch: &Branch) -> Result<()> {
        match old_branch.branch_from_message_id {
            Some(fork_point) => {
                let siblings = self.store.children_of(fork_point)?;
                if let Some(original_first) = siblings.iter().min_by_key(|m| m.id) {
                    self.store
                        .update_chosen_next_id(fork_point, Some(original_first.id))?;
                }
            }
            None => {
                let roots = self.store.roots_of_session(&old_branch.session_id)?;
                let original_first = roots.iter().min_by_key(|m| m.id).map(|m| m.id);
                self.store
                    .update_chosen_first_id(&old_branch.session_id, original_first)?;
            }
        }
        Ok(())
    }

    /// Answer a paused tool call. Deny persists the canned denial and
    /// completes without touching the provider; approve re-dispatches and
    /// resumes the streaming loop.
    #[instrument(skip(self, modified_args, cancel))]
    pub async fn confirm_pending(
        &self,
        session_id: &str,
        branch_id: &str,
        approved: bool,
        modified_args: Option<Value>,
        model: &str,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome> {
        let branch = self.store.fetch_branch(branch_id)?;
        let pending_raw = branch
            .pending_confirmation
            .clone()
            .ok_or_else(|| BranchError::NoPendingConfirmation(branch_id.to_string()))?;
        let pending: Value = serde_json::from_str(&pending_raw)?;
        let tool_name = pending
            .get("tool_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let args = modified_args.unwrap_or_else(|| pending.get("arguments").cloned().unwrap_or(Value::Null));

        let session = self.store.fetch_session(session_id)?;
        let chain = Arc::new(MessageChain::open(self.store.clone(), session_id, branch_id)?);
        let full = assemble_branch_chain(&self.store, branch_id)?;
        let user_message_id = full
            .iter()
            .rev()
            .find(|m| m.msg_type == MessageType::UserText)
            .map(|m| m.id)
            .unwrap_or(0);

        let req = TurnRequest {
            session_id: session_id.to_string(),
            branch_id: branch_id.to_string(),
            model: model.to_string(),
            system_prompt: session.system_prompt,
            generation: 0,
            user_message_id,
        };
        let outcome = self
            .orchestrator
            .resume_after_confirmation(req, chain, &tool_name, args, approved, cancel)
            .await?;
        Ok(outcome)
    }

    /// Trim trailing `error`/`model_error` messages from the branch and
    /// resume the streaming loop. History is assembled before the trim so
    /// an inherited-context retry (branch now empty) still works.
    #[instrument(skip(self, cancel))]
    pub async fn retry_error(
        &self,
        session_id: &str,
        branch_id: &str,
        model: &str,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome> {
        let _history_before = assemble_branch_chain(&self.store, branch_id)?;

        let mut own = self.store.messages_in_branch(branch_id)?;
        while let Some(last) = own.last() {
            if matches!(last.msg_type, MessageType::Error | MessageType::ModelError) {
                self.store.delete_message(last.id)?;
                own.pop();
            } else {
                break;
            }
        }

        let session = self.store.fetch_session(session_id)?;
        let chain = Arc::new(MessageChain::open(self.store.clone(), session_id, branch_id)?);
        let curated = curated_context(&self.store, branch_id)?;
        let seed = curated_to_provider_messages(&curated);

        let full = assemble_branch_chain(&self.store, branch_id)?;
        let user_message_id = full
            .iter()
            .rev()
            .find(|m| m.msg_type == MessageType::UserText)
            .map(|m| m.id)
            .unwrap_or(0);

        let req = TurnRequest {
            session_id: session_id.to_string(),
            branch_id: branch_id.to_string(),
            model: model.to_string(),
            system_prompt: session.system_prompt,
            generation: 0,
            user_message_id,
        };
        let outcome = self.orchestrator.resume_turn(req, chain, seed, cancel).await?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use convo_agent::{
        ChatRequest, LlmProvider, ProviderError, ResponsePart, ToolDispatcher, ToolOutcome, ToolSpec,
    };
    use convo_hub::SseHub;
    use convo_registry::CallRegistry;
    use rusqlite::Connection;
    use tokio::sync::mpsc;

    fn store() -> Arc<MessageStore> {
        let conn = Connection::open_in_memory().unwrap();
        convo_store::db::init_db(&conn).unwrap();
        Arc::new(MessageStore::new(conn))
    }

    struct EchoProvider;

    #[async_trait]
    impl LlmProvider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }
        async fn send_stream(
            &self,
            _req: &ChatRequest,
            tx: mpsc::Sender<ResponsePart>,
        ) -> std::result::Result<(), ProviderError> {
            tx.send(ResponsePart::TextDelta { text: "ok".into() }).await.ok();
            tx.send(ResponsePart::Done).await.ok();
            Ok(())
        }
    }

    struct NoTools;

    #[async_trait]
    impl ToolDispatcher for NoTools {
        fn available_tools(&self) -> Vec<ToolSpec> {
            vec![]
        }
        fn has_tool(&self, _name: &str) -> bool {
            false
        }
        async fn dispatch(&self, _name: &str, _args: &Value) -> ToolOutcome {
            ToolOutcome::Error(serde_json::json!({}))
        }
        async fn dispatch_confirmed(&self, _name: &str, _args: &Value) -> ToolOutcome {
            ToolOutcome::Error(serde_json::json!({}))
        }
    }

    fn ops(store: Arc<MessageStore>) -> BranchOps {
        let orch = Arc::new(Orchestrator::new(
            store.clone(),
            Arc::new(SseHub::new()),
            Arc::new(CallRegistry::new()),
            Arc::new(EchoProvider),
            Arc::new(NoTools),
            25,
        ));
        BranchOps::new(store, orch)
    }

    #[tokio::test]
    async fn interior_edit_forks_a_new_branch_and_rewires_parent() {
        let store = store();
        let (session, branch) = store.create_session("", "sp", "ws").unwrap();
        let user = store
            .append_message(&session.id, &branch.id, None, NewMessage::new(MessageType::UserText, "hi"))
            .unwrap();
        let model = store
            .append_message(&session.id, &branch.id, Some(user.id), NewMessage::new(MessageType::ModelText, "hello"))
            .unwrap();
        let user2 = store
            .append_message(&session.id, &branch.id, Some(model.id), NewMessage::new(MessageType::UserText, "old question"))
            .unwrap();

        let branch_ops = ops(store.clone());
        let (new_branch, outcome) = branch_ops
            .create_branch(&session.id, user2.id, "new question", "test-model", CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, TurnOutcome::Complete);
        assert_eq!(new_branch.branch_from_message_id, Some(model.id));

        let refetched_model = store.fetch_message(model.id).unwrap();
        assert_ne!(refetched_model.chosen_next_id, Some(user2.id));

        let session_after = store.fetch_session(&session.id).unwrap();
        assert_eq!(session_after.primary_branch_id, new_branch.id);
    }

    #[tokio::test]
    async fn switch_branch_restores_old_primarys_pointer() {
        let store = store();
        let (session, branch_a) = store.create_session("", "sp", "ws").unwrap();
        let model_a = store
            .append_message(&session.id, &branch_a.id, None, NewMessage::new(MessageType::ModelText, "a"))
            .unwrap();
        let user_b = store
            .append_message(&session.id, &branch_a.id, Some(model_a.id), NewMessage::new(MessageType::UserText, "b"))
            .unwrap();

        let branch_c = store
            .create_branch(&session.id, Some(&branch_a.id), Some(model_a.id))
            .unwrap();
        let user_c = store
            .append_message(&session.id, &branch_c.id, Some(model_a.id), NewMessage::new(MessageType::UserText, "c"))
            .unwrap();

        let branch_ops = ops(store.clone());
        branch_ops.switch_branch(&session.id, &branch_c.id).unwrap();
        let after_switch = store.fetch_message(model_a.id).unwrap();
        assert_eq!(after_switch.chosen_next_id, Some(user_c.id));

        branch_ops.switch_branch(&session.id, &branch_a.id).unwrap();
        let after_switch_back = store.fetch_message(model_a.id).unwrap();
        assert_eq!(after_switch_back.chosen_next_id, Some(user_b.id));
    }

    #[tokio::test]
    async fn retry_error_trims_trailing_error_messages() {
        let store = store();
        let (session, branch) = store.create_session("", "sp", "ws").unwrap();
        let user = store
            .append_message(&session.id, &branch.id, None, NewMessage::new(MessageType::UserText, "hi"))
            .unwrap();
        let err = store
            .append_message(&session.id, &branch.id, Some(user.id), NewMessage::new(MessageType::ModelError, "boom"))
            .unwrap();

        let branch_ops = ops(store.clone());
        let outcome = branch_ops
            .retry_error(&session.id, &branch.id, "test-model", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, TurnOutcome::Complete);
        assert!(store.fetch_message_opt(err.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn confirm_deny_persists_canned_response_and_completes() {
        let store = store();
        let (session, branch) = store.create_session("", "sp", "ws").unwrap();
        let user = store
            .append_message(&session.id, &branch.id, None, NewMessage::new(MessageType::UserText, "hi"))
            .unwrap();
        let _ = user;
        store
            .set_pending_confirmation(
                &branch.id,
                Some(&serde_json::json!({"tool_name":"delete_file","arguments":{"path":"/tmp/x"}}).to_string()),
            )
            .unwrap();

        let branch_ops = ops(store.clone());
        let outcome = branch_ops
            .confirm_pending(&session.id, &branch.id, false, None, "test-model", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, TurnOutcome::Complete);

        let refetched = store.fetch_branch(&branch.id).unwrap();
        assert!(refetched.pending_confirmation.is_none());
        let latest = store.latest_message_in_branch(&branch.id).unwrap().unwrap();
        assert_eq!(latest.msg_type, MessageType::FunctionResponse);
        assert!(latest.text.contains("User denied tool execution"));
    }
}
