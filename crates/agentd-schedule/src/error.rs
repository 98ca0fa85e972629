//! Error types for agentd-schedule

use thiserror::Error;

/// Scheduler error type
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("invalid task id: {0} (1-32 chars, alphanumeric and underscore)")]
    InvalidTaskId(String),

    #[error("invalid time {hour:02}:{minute:02}")]
    InvalidTime { hour: u32, minute: u32 },

    #[error("invalid schedule: {0}")]
    InvalidSpec(String),

    #[error("schedule not found: {0}")]
    NotFound(String),

    #[error("schedule already exists: {0}")]
    Duplicate(String),

    #[error("unknown timezone: {0}")]
    Timezone(String),

    #[error(transparent)]
    Core(#[from] agentd_core::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for agentd-schedule
pub type Result<T> = std::result::Result<T, ScheduleError>;
