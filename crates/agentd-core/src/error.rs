//! Error types for agentd-core

use std::path::PathBuf;

use thiserror::Error;

use crate::llm::LlmError;

/// Main error type for agentd-core
#[derive(Error, Debug)]
pub enum Error {
    #[error("LLM backend error: {0}")]
    Backend(#[from] LlmError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("no active session for user {0}")]
    SessionNotFound(i64),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("user {0} is disabled")]
    UserDisabled(i64),

    #[error("quota denied: {0}")]
    QuotaDenied(String),

    #[error("path escapes working directory: {0}")]
    PathEscape(PathBuf),

    #[error("chat adapter error: {0}")]
    Adapter(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for agentd-core
pub type Result<T> = std::result::Result<T, Error>;
