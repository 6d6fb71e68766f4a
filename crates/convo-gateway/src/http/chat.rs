//! `/api/chat` and `/api/chat/{id}` — session creation, turn submission,
//! session load (JSON or SSE), deletion, and call cancellation (§6).

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::Event as SseEvent;
use axum::response::{IntoResponse, Response};
use axum::Json;
use convo_agent::TurnRequest;
use convo_chain::{ChainAppend, MessageChain};
use convo_core::types::MessageType;
use convo_history::{ui_history, PageRequest};
use convo_hub::Event as HubEvent;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::app::AppState;
use crate::error::ApiError;
use crate::hub_guard::{spawn_background_turn, WriterGuard};
use crate::http::types::InitialState;

/// Default page size for the history embedded in the initial-state record.
const INITIAL_HISTORY_LIMIT: usize = 200;

#[derive(Debug, Deserialize)]
pub struct CreateChatRequest {
    pub message: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub workspace_id: String,
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AddMessageRequest {
    pub message: String,
    pub model: Option<String>,
}

/// `POST /api/chat` — create a session, persist the first user message,
/// and stream the resulting turn back over SSE.
pub async fn create_session_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateChatRequest>,
) -> Result<Response, ApiError> {
    if req.message.trim().is_empty() {
        return Err(ApiError::input("message cannot be empty"));
    }

    let (session, branch) =
        state
            .store
            .create_session("", &req.system_prompt, &req.workspace_id)?;
    let chain = MessageChain::open(state.store.clone(), &session.id, &branch.id)?;
    let user_msg = chain.add(ChainAppend::new(MessageType::UserText, req.message), vec![])?;

    let model = req.model.unwrap_or_else(|| state.default_model().to_string());
    Ok(begin_turn_stream(
        state,
        session.id,
        branch.id,
        session.system_prompt,
        model,
        user_msg.id,
    )
    .await)
}

/// `POST /api/chat/{id}` — append a user message to the session's primary
/// branch and stream the resulting turn.
pub async fn add_message_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(req): Json<AddMessageRequest>,
) -> Result<Response, ApiError> {
    if req.message.trim().is_empty() {
        return Err(ApiError::input("message cannot be empty"));
    }
    let session = state.store.fetch_session(&session_id)?;

    if state.registry.has_active(&session_id) {
        return Ok(conflict_stream(state, session_id));
    }

    let chain = MessageChain::open(
        state.store.clone(),
        &session_id,
        &session.primary_branch_id,
    )?;
    let user_msg = chain.add(ChainAppend::new(MessageType::UserText, req.message), vec![])?;

    let model = req.model.unwrap_or_else(|| state.default_model().to_string());
    Ok(begin_turn_stream(
        state,
        session_id,
        session.primary_branch_id,
        session.system_prompt,
        model,
        user_msg.id,
    )
    .await)
}

/// `GET /api/chat/{id}` — JSON snapshot, or an SSE attach for
/// `Accept: text/event-stream` (§4.5's late-subscriber path).
pub async fn load_session_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let wants_sse = headers
        .get(axum::http::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/event-stream"))
        .unwrap_or(false);

    let initial = build_initial_state(&state, &session_id)?;
    let active = state.registry.has_active(&session_id);

    if !wants_sse {
        return Ok(Json(initial).into_response());
    }

    let (writer_id, mut rx) = state.hub.subscribe(&session_id);
    let guard = WriterGuard::new(state.hub.clone(), session_id.clone(), writer_id);
    let code = if active { 'I' } else { 'J' };
    let first = HubEvent::new(code, serde_json::to_string(&initial).unwrap_or_default());

    let stream = async_stream::stream! {
        let _guard = guard;
        yield Ok::<_, Infallible>(crate::sse::encode(&first));
        while let Some(event) = rx.recv().await {
            yield Ok(crate::sse::encode(&event));
        }
    };
    Ok(crate::sse::response(state.config.gateway.sse_heartbeat_secs, stream).into_response())
}

/// `DELETE /api/chat/{id}` — cancel any active call, then remove the
/// session, its branches, messages, and unreferenced blobs.
pub async fn delete_session_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.registry.has_active(&session_id) {
        state.registry.cancel(&session_id).ok();
        state.registry.remove(&session_id);
    }
    state.store.delete_session(&session_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /api/chat/{id}/call` — cancel the in-flight turn.
pub async fn cancel_call_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.registry.cancel(&session_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Shared tail for both turn-starting handlers: subscribe, broadcast the
/// persisted-user-message ack, register the call, hand the orchestrator an
/// extra hub reference for its post-stream work, and hand back the SSE
/// response that forwards everything this writer sees from here on.
async fn begin_turn_stream(
    state: Arc<AppState>,
    session_id: String,
    branch_id: String,
    system_prompt: String,
    model: String,
    user_message_id: i64,
) -> Response {
    let (writer_id, mut rx) = state.hub.subscribe(&session_id);
    state
        .hub
        .broadcast(&session_id, HubEvent::new('A', user_message_id.to_string()));

    let cancel = CancellationToken::new();
    if let Err(e) = state.registry.start(&session_id, cancel.clone()) {
        state.hub.broadcast(&session_id, HubEvent::new('E', e.to_string()));
        let guard = WriterGuard::new(state.hub.clone(), session_id.clone(), writer_id);
        let stream = async_stream::stream! {
            let _guard = guard;
            while let Some(event) = rx.recv().await {
                yield Ok::<_, Infallible>(crate::sse::encode(&event));
            }
        };
        return crate::sse::response(state.config.gateway.sse_heartbeat_secs, stream).into_response();
    }

    // The orchestrator runs detached from this HTTP request (§5: client
    // disconnect never cancels a turn) and holds its own reference on the
    // writer for as long as it runs, releasing it when it's done.
    state.hub.add(&session_id, writer_id);
    let req = TurnRequest {
        session_id: session_id.clone(),
        branch_id,
        model,
        system_prompt,
        generation: 0,
        user_message_id,
    };
    let orchestrator = state.orchestrator.clone();
    spawn_background_turn(
        state.hub.clone(),
        state.registry.clone(),
        session_id.clone(),
        writer_id,
        async move { orchestrator.run_turn(req, cancel).await },
    );

    let guard = WriterGuard::new(state.hub.clone(), session_id, writer_id);
    let stream = async_stream::stream! {
        let _guard = guard;
        while let Some(event) = rx.recv().await {
            yield Ok::<_, Infallible>(crate::sse::encode(&event));
        }
    };
    crate::sse::response(state.config.gateway.sse_heartbeat_secs, stream).into_response()
}

/// §7 Conflict: a call is already active for this session. No persistence
/// happens; the stream emits one `E` and closes.
fn conflict_stream(state: Arc<AppState>, session_id: String) -> Response {
    let (writer_id, _rx) = state.hub.subscribe(&session_id);
    let guard = WriterGuard::new(state.hub.clone(), session_id.clone(), writer_id);
    let message = format!("a call is already active for session {session_id}");
    let stream = async_stream::stream! {
        let _guard = guard;
        yield Ok::<SseEvent, Infallible>(crate::sse::encode(&HubEvent::new('E', message)));
    };
    crate::sse::response(state.config.gateway.sse_heartbeat_secs, stream).into_response()
}

pub(crate) fn build_initial_state(state: &AppState, session_id: &str) -> Result<InitialState, ApiError> {
    let session = state.store.fetch_session(session_id)?;
    let page = ui_history(
        &state.store,
        &session.primary_branch_id,
        PageRequest {
            before_message_id: 0,
            limit: INITIAL_HISTORY_LIMIT,
        },
    )?;
    let branch = state.store.fetch_branch(&session.primary_branch_id)?;
    let roots: Vec<i64> = state
        .store
        .roots_of_session(session_id)?
        .into_iter()
        .map(|m| m.id)
        .collect();
    let pending_confirmation: Option<Value> = branch
        .pending_confirmation
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok());

    Ok(InitialState {
        session_id: session.id.clone(),
        history: page.messages.into_iter().map(Into::into).collect(),
        system_prompt: session.system_prompt,
        workspace_id: session.workspace_id,
        primary_branch_id: session.primary_branch_id,
        roots,
        call_elapsed_time_seconds: state.registry.elapsed_seconds(session_id),
        pending_confirmation,
    })
}
