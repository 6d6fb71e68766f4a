use convo_core::error::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("a call is already active for session {0}")]
    AlreadyActive(String),

    #[error("no active call for session {0}")]
    NotActive(String),
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::AlreadyActive(_) => ErrorKind::Conflict,
            RegistryError::NotActive(_) => ErrorKind::NotFound,
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;
