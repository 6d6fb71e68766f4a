//! `/api/chat/{id}/branch` and its `/confirm` and `/retry-error`
//! sub-resources (§4.7, §6).

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use convo_registry::RegistryError;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::app::AppState;
use crate::error::ApiError;
use crate::hub_guard::{spawn_background_turn, WriterGuard};

#[derive(Debug, Deserialize)]
pub struct CreateBranchRequest {
    pub target_message_id: i64,
    #[serde(default)]
    pub text: String,
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateBranchQuery {
    /// `?retry=1` regenerates the assistant's response to the target
    /// message unchanged, rather than editing its text.
    #[serde(default)]
    pub retry: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct SwitchBranchRequest {
    pub branch_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    pub approved: bool,
    #[serde(default)]
    pub modified_args: Option<Value>,
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RetryErrorRequest {
    pub model: Option<String>,
}

/// `POST /api/chat/{id}/branch` — fork a new branch from an edited
/// `user_text` message (or, with `?retry=1`, from the same text
/// unchanged) and stream the resulting turn. Branch creation happens
/// inline (it's a handful of store writes), but the turn itself runs on
/// a detached task like `confirm`/`retry-error`, so a client disconnect
/// mid-turn does not cancel it (§5). The new branch id is surfaced as
/// the `X-Branch-Id` response header since the SSE wire protocol (§6)
/// has no event code carrying it.
pub async fn create_branch_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<CreateBranchQuery>,
    Json(req): Json<CreateBranchRequest>,
) -> Result<Response, ApiError> {
    if state.registry.has_active(&session_id) {
        return Err(ApiError::from(RegistryError::AlreadyActive(session_id)));
    }

    let text = if query.retry.unwrap_or(0) != 0 {
        state.store.fetch_message(req.target_message_id)?.text
    } else {
        if req.text.trim().is_empty() {
            return Err(ApiError::input("text cannot be empty"));
        }
        req.text
    };
    let model = req.model.unwrap_or_else(|| state.default_model().to_string());

    let (branch, chain, turn_req, seed) = state.branch_ops.prepare_branch_creation(
        &session_id,
        req.target_message_id,
        &text,
        &model,
    )?;

    let (writer_id, rx) = state.hub.subscribe(&session_id);
    let cancel = CancellationToken::new();
    state.registry.start(&session_id, cancel.clone())?;
    state.hub.add(&session_id, writer_id);

    let branch_ops = state.branch_ops.clone();
    spawn_background_turn(
        state.hub.clone(),
        state.registry.clone(),
        session_id.clone(),
        writer_id,
        async move { branch_ops.run_prepared_turn(chain, turn_req, seed, cancel).await },
    );

    let mut response = resume_stream(state, session_id, writer_id, rx);
    if let Ok(value) = HeaderValue::from_str(&branch.id) {
        response.headers_mut().insert("x-branch-id", value);
    }
    Ok(response)
}

/// `PUT /api/chat/{id}/branch` — synchronous primary-branch switch, no
/// streaming involved.
pub async fn switch_branch_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(req): Json<SwitchBranchRequest>,
) -> Result<StatusCode, ApiError> {
    state.branch_ops.switch_branch(&session_id, &req.branch_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/chat/{id}/branch/{branch_id}/confirm` — answer a paused
/// tool call and resume the turn.
pub async fn confirm_handler(
    State(state): State<Arc<AppState>>,
    Path((session_id, branch_id)): Path<(String, String)>,
    Json(req): Json<ConfirmRequest>,
) -> Result<Response, ApiError> {
    if state.registry.has_active(&session_id) {
        return Err(ApiError::from(RegistryError::AlreadyActive(session_id)));
    }
    let model = req.model.unwrap_or_else(|| state.default_model().to_string());

    let (writer_id, rx) = state.hub.subscribe(&session_id);
    let cancel = CancellationToken::new();
    state.registry.start(&session_id, cancel.clone())?;
    state.hub.add(&session_id, writer_id);

    let branch_ops = state.branch_ops.clone();
    let session_id_task = session_id.clone();
    spawn_background_turn(
        state.hub.clone(),
        state.registry.clone(),
        session_id.clone(),
        writer_id,
        async move {
            branch_ops
                .confirm_pending(
                    &session_id_task,
                    &branch_id,
                    req.approved,
                    req.modified_args,
                    &model,
                    cancel,
                )
                .await
        },
    );

    Ok(resume_stream(state, session_id, writer_id, rx))
}

/// `POST /api/chat/{id}/branch/{branch_id}/retry-error` — trim trailing
/// error messages and resume the streaming loop.
pub async fn retry_error_handler(
    State(state): State<Arc<AppState>>,
    Path((session_id, branch_id)): Path<(String, String)>,
    Json(req): Json<RetryErrorRequest>,
) -> Result<Response, ApiError> {
    if state.registry.has_active(&session_id) {
        return Err(ApiError::from(RegistryError::AlreadyActive(session_id)));
    }
    let model = req.model.unwrap_or_else(|| state.default_model().to_string());

    let (writer_id, rx) = state.hub.subscribe(&session_id);
    let cancel = CancellationToken::new();
    state.registry.start(&session_id, cancel.clone())?;
    state.hub.add(&session_id, writer_id);

    let branch_ops = state.branch_ops.clone();
    let session_id_task = session_id.clone();
    spawn_background_turn(
        state.hub.clone(),
        state.registry.clone(),
        session_id.clone(),
        writer_id,
        async move { branch_ops.retry_error(&session_id_task, &branch_id, &model, cancel).await },
    );

    Ok(resume_stream(state, session_id, writer_id, rx))
}

fn resume_stream(
    state: Arc<AppState>,
    session_id: String,
    writer_id: convo_hub::WriterId,
    mut rx: tokio::sync::mpsc::Receiver<convo_hub::Event>,
) -> Response {
    let guard = WriterGuard::new(state.hub.clone(), session_id, writer_id);
    let stream = async_stream::stream! {
        let _guard = guard;
        while let Some(event) = rx.recv().await {
            yield Ok::<_, Infallible>(crate::sse::encode(&event));
        }
    };
    crate::sse::response(state.config.gateway.sse_heartbeat_secs, stream).into_response()
}
