pub mod config;
pub mod error;
pub mod types;

pub use config::ConvoConfig;
pub use error::{CoreError, ErrorKind};
pub use types::{Attachment, BranchId, CallState, MessageId, MessageType, SessionId, WorkspaceId};
