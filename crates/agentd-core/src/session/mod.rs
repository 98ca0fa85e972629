//! Session and conversation lifecycle
//!
//! At most one active session per user. Expired sessions are summarized
//! and archived; the summaries bootstrap context for future sessions.

mod chat_log;
mod manager;
mod types;

pub use chat_log::{ChatLogger, ChatRole};
pub use manager::SessionManager;
pub use types::{ChatSummary, ExpiryReason, Session};
