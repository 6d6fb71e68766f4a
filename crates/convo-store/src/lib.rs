pub mod blob;
pub mod db;
pub mod error;
pub mod store;
pub mod types;

pub use error::StoreError;
pub use store::MessageStore;
pub use types::{Branch, Message, NewMessage, Session};
