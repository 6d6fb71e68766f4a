use convo_core::error::ErrorKind;
use convo_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ChainError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChainError::Store(e) => e.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ChainError>;
