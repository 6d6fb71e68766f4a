use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use convo_agent::{LlmProvider, Orchestrator};
use convo_agent::ToolDispatcher;
use convo_branch::BranchOps;
use convo_core::config::ConvoConfig;
use convo_hub::SseHub;
use convo_registry::CallRegistry;
use convo_store::MessageStore;

/// Central shared state, passed as `Arc<AppState>` to every handler.
/// Mirrors the teacher's single `AppState` struct bundling the process
/// wide singletons (Call Registry, SSE Hub) alongside the store and the
/// components built on top of it.
pub struct AppState {
    pub config: ConvoConfig,
    pub store: Arc<MessageStore>,
    pub hub: Arc<SseHub>,
    pub registry: Arc<CallRegistry>,
    pub orchestrator: Arc<Orchestrator>,
    pub branch_ops: Arc<BranchOps>,
}

impl AppState {
    pub fn new(
        config: ConvoConfig,
        store: Arc<MessageStore>,
        provider: Arc<dyn LlmProvider>,
        dispatcher: Arc<dyn ToolDispatcher>,
    ) -> Self {
        let hub = Arc::new(SseHub::new());
        let registry = Arc::new(CallRegistry::new());
        let orchestrator = Arc::new(Orchestrator::with_name_inference_deadline(
            store.clone(),
            hub.clone(),
            registry.clone(),
            provider,
            dispatcher,
            config.orchestrator.max_tool_iterations,
            config.orchestrator.name_inference_deadline_secs,
        ));
        let branch_ops = Arc::new(BranchOps::new(store.clone(), orchestrator.clone()));

        Self {
            config,
            store,
            hub,
            registry,
            orchestrator,
            branch_ops,
        }
    }

    pub fn default_model(&self) -> &str {
        &self.config.orchestrator.default_model
    }
}

/// Assemble the full Axum router for the §6 HTTP surface.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route(
            "/api/chat",
            post(crate::http::chat::create_session_handler),
        )
        .route(
            "/api/chat/{id}",
            get(crate::http::chat::load_session_handler)
                .post(crate::http::chat::add_message_handler)
                .delete(crate::http::chat::delete_session_handler),
        )
        .route(
            "/api/chat/{id}/call",
            delete(crate::http::chat::cancel_call_handler),
        )
        .route(
            "/api/chat/{id}/branch",
            post(crate::http::branch::create_branch_handler)
                .put(crate::http::branch::switch_branch_handler),
        )
        .route(
            "/api/chat/{id}/branch/{branch_id}/confirm",
            post(crate::http::branch::confirm_handler),
        )
        .route(
            "/api/chat/{id}/branch/{branch_id}/retry-error",
            post(crate::http::branch::retry_error_handler),
        )
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
}
