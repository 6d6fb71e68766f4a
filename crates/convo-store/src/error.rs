use convo_core::error::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("branch not found: {0}")]
    BranchNotFound(String),

    #[error("message not found: {0}")]
    MessageNotFound(i64),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::SessionNotFound(_)
            | StoreError::BranchNotFound(_)
            | StoreError::MessageNotFound(_) => ErrorKind::NotFound,
            StoreError::Constraint(_) => ErrorKind::Input,
            StoreError::Database(_) | StoreError::Io(_) | StoreError::Serialization(_) => {
                ErrorKind::Storage
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
