use thiserror::Error;

/// The taxonomy every crate-local error maps into via `kind()`. The HTTP
/// layer picks a status code (or SSE event) from this alone, never by
/// matching on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Input,
    NotFound,
    Conflict,
    Provider,
    Tool,
    Cancel,
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Input => "input",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Provider => "provider",
            ErrorKind::Tool => "tool",
            ErrorKind::Cancel => "cancel",
            ErrorKind::Storage => "storage",
        }
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Config(_) => ErrorKind::Input,
            CoreError::Serialization(_) => ErrorKind::Input,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
