use convo_core::error::ErrorKind;
use convo_agent::OrchestratorError;
use convo_history::HistoryError;
use convo_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BranchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error("message {0} is not a user_text message")]
    NotUserText(i64),

    #[error("message {0} has no parent and is not the session's chosen_first_id")]
    RootEditMismatch(i64),

    #[error("branch {0} has no pending confirmation")]
    NoPendingConfirmation(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BranchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BranchError::Store(e) => e.kind(),
            BranchError::History(e) => e.kind(),
            BranchError::Orchestrator(e) => e.kind(),
            BranchError::NotUserText(_) | BranchError::RootEditMismatch(_) => ErrorKind::Input,
            BranchError::NoPendingConfirmation(_) => ErrorKind::Conflict,
            BranchError::Serialization(_) => ErrorKind::Input,
        }
    }
}

pub type Result<T> = std::result::Result<T, BranchError>;
