//! Error types for agentd-dashboard

use thiserror::Error;

/// Dashboard error type
#[derive(Error, Debug)]
pub enum DashboardError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for agentd-dashboard
pub type Result<T> = std::result::Result<T, DashboardError>;
