use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque session identifier (UUIDv7 — time-sortable for log correlation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Opaque branch identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchId(pub String);

impl BranchId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for BranchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for BranchId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for BranchId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Message identifier: a monotonic integer, unique within a session.
pub type MessageId = i64;

/// Workspace identifier — opaque, owned by an external collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkspaceId(pub String);

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for WorkspaceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for WorkspaceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Discriminant for a message row. See the data model for the full
/// semantics of each variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    UserText,
    ModelText,
    Thought,
    FunctionCall,
    FunctionResponse,
    SystemPrompt,
    EnvChanged,
    Compression,
    Command,
    Error,
    ModelError,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::UserText => "user_text",
            MessageType::ModelText => "model_text",
            MessageType::Thought => "thought",
            MessageType::FunctionCall => "function_call",
            MessageType::FunctionResponse => "function_response",
            MessageType::SystemPrompt => "system_prompt",
            MessageType::EnvChanged => "env_changed",
            MessageType::Compression => "compression",
            MessageType::Command => "command",
            MessageType::Error => "error",
            MessageType::ModelError => "model_error",
        }
    }

    /// Never part of the next-turn LLM context, regardless of other rules.
    pub fn always_excluded_from_context(&self) -> bool {
        matches!(
            self,
            MessageType::Thought | MessageType::Error | MessageType::ModelError
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user_text" => Ok(MessageType::UserText),
            "model_text" => Ok(MessageType::ModelText),
            "thought" => Ok(MessageType::Thought),
            "function_call" => Ok(MessageType::FunctionCall),
            "function_response" => Ok(MessageType::FunctionResponse),
            "system_prompt" => Ok(MessageType::SystemPrompt),
            "env_changed" => Ok(MessageType::EnvChanged),
            "compression" => Ok(MessageType::Compression),
            "command" => Ok(MessageType::Command),
            "error" => Ok(MessageType::Error),
            "model_error" => Ok(MessageType::ModelError),
            other => Err(format!("unknown message type: {}", other)),
        }
    }
}

/// Terminal/active state of a call tracked by the Call Registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Running,
    Completed,
    Failed,
    Canceled,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CallState::Running)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallState::Running => write!(f, "running"),
            CallState::Completed => write!(f, "completed"),
            CallState::Failed => write!(f, "failed"),
            CallState::Canceled => write!(f, "canceled"),
        }
    }
}

/// An attachment descriptor: content-addressed, never inlined on the row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub hash: String,
    /// Set once a `clearblobs` command hides the underlying bytes.
    #[serde(default)]
    pub omitted: bool,
}
