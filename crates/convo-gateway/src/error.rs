use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use convo_branch::BranchError;
use convo_chain::ChainError;
use convo_core::error::ErrorKind;
use convo_history::HistoryError;
use convo_registry::RegistryError;
use convo_store::StoreError;
use serde_json::json;
use thiserror::Error;

/// Aggregates every crate-local error into the single type `?` can bubble
/// up to an Axum handler through. Each crate classifies its own variants
/// via `kind()` (§7's taxonomy); this layer only has to turn that
/// classification into a status code.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Branch(#[from] BranchError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("{0}")]
    Input(String),
}

impl ApiError {
    fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Store(e) => e.kind(),
            ApiError::History(e) => e.kind(),
            ApiError::Registry(e) => e.kind(),
            ApiError::Branch(e) => e.kind(),
            ApiError::Chain(e) => e.kind(),
            ApiError::Input(_) => ErrorKind::Input,
        }
    }

    pub fn input(message: impl Into<String>) -> Self {
        ApiError::Input(message.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.kind() {
            ErrorKind::Input => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Provider => StatusCode::BAD_GATEWAY,
            ErrorKind::Tool => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Cancel => StatusCode::OK,
            ErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
