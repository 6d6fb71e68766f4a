use convo_core::error::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("unknown writer for session {0}")]
    UnknownWriter(String),
}

impl HubError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::NotFound
    }
}

pub type Result<T> = std::result::Result<T, HubError>;
