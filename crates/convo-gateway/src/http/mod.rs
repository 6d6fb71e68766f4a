pub mod branch;
pub mod chat;
pub mod health;
pub mod types;
