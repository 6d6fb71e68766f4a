use convo_core::error::ErrorKind;
use convo_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl HistoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HistoryError::Store(e) => e.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, HistoryError>;
