//! Event payloads pushed to dashboard subscribers
//!
//! Serialized as `{"type": ..., "data": ...}` envelopes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle event delivered over the event bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    TaskCreated {
        task_id: String,
        description: String,
        created_at: DateTime<Utc>,
    },
    TaskUpdate {
        task_id: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        completed_at: Option<DateTime<Utc>>,
    },
    ScheduleExecuted {
        task_id: String,
        run_count: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        next_run: Option<String>,
    },
    StorageUpdate {
        used_bytes: u64,
        quota_bytes: u64,
    },
    /// Keepalive reply to a client ping
    Pong,
}

impl Event {
    pub fn task_update(task_id: impl Into<String>, status: impl Into<String>) -> Self {
        Event::TaskUpdate {
            task_id: task_id.into(),
            status: status.into(),
            result: None,
            completed_at: None,
        }
    }
}
