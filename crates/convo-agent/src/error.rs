use convo_core::error::ErrorKind;
use convo_history::HistoryError;
use convo_registry::RegistryError;
use convo_store::StoreError;
use thiserror::Error;

use crate::provider::ProviderError;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::Store(e) => e.kind(),
            OrchestratorError::History(e) => e.kind(),
            OrchestratorError::Registry(e) => e.kind(),
            OrchestratorError::Provider(_) => ErrorKind::Provider,
            OrchestratorError::Serialization(_) => ErrorKind::Input,
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
