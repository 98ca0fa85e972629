//! LLM backend types and trait definition

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Error taxonomy of the LLM backend
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rate limited: {0}")]
    RateLimit(String),

    /// The backend no longer knows the remote session id
    #[error("remote session unknown")]
    RemoteUnknown,

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Token and cost accounting for one invocation
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

/// A tool call requested by the model, not yet validated
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallIntent {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One invocation of the backend
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// The user-visible prompt for this turn
    pub prompt: String,
    /// Optional system prompt
    pub system: Option<String>,
    /// Recovered context block, prepended when the session went stale
    pub context: Option<String>,
    /// Remote session token from a previous reply, if resuming
    pub remote_id: Option<String>,
    /// Cooperative cancellation handle
    pub cancel: CancellationToken,
}

impl LlmRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            context: None,
            remote_id: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_remote_id(mut self, remote_id: Option<String>) -> Self {
        self.remote_id = remote_id;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Reply from one invocation
#[derive(Debug, Clone, Default)]
pub struct LlmReply {
    pub text: String,
    pub tool_calls: Vec<ToolCallIntent>,
    pub usage: Usage,
    /// Remote session token to carry into the next invocation
    pub remote_id: Option<String>,
}

/// Opaque model provider
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Run one conversational turn
    async fn invoke(&self, request: LlmRequest) -> std::result::Result<LlmReply, LlmError>;

    /// Summarize a chat log excerpt for archival
    async fn summarize(&self, excerpt: &str) -> std::result::Result<String, LlmError>;
}
