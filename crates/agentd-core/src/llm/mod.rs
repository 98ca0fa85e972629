//! LLM backend contract and HTTP client
//!
//! The core treats the model provider as an opaque backend behind the
//! [`LlmBackend`] trait. `RemoteUnknown` errors are the signal that drives
//! session context recovery.

mod client;
mod types;

pub use client::HttpBackend;
pub use types::{LlmBackend, LlmError, LlmReply, LlmRequest, ToolCallIntent, Usage};
