//! Session types

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// One conversational scope between a user and the LLM backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub message_count: u64,
    /// Completed user/assistant exchanges
    pub turns: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    /// Token issued by the LLM backend; absent until the first call
    pub remote_id: Option<String>,
}

impl Session {
    pub fn new(user_id: i64, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            created_at: now,
            last_activity: now,
            message_count: 0,
            turns: 0,
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
            remote_id: None,
        }
    }

    /// A timeout of zero disables expiry
    pub fn is_expired(&self, timeout_seconds: u64, now: DateTime<Utc>) -> bool {
        if timeout_seconds == 0 {
            return false;
        }
        now - self.last_activity > Duration::seconds(timeout_seconds as i64)
    }

    /// Short id used in file names
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(8)]
    }
}

/// Why a session was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryReason {
    Timeout,
    /// The backend no longer recognized the remote session id
    RemoteUnknown,
    /// The user asked for a fresh session
    ManualNew,
    /// Context compaction under token pressure
    Compact,
}

impl ExpiryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpiryReason::Timeout => "timeout",
            ExpiryReason::RemoteUnknown => "remote_unknown",
            ExpiryReason::ManualNew => "manual_new",
            ExpiryReason::Compact => "compact",
        }
    }
}

/// Archived summary of a closed session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSummary {
    /// Summary file stem, e.g. `summary_20250301_120000`
    pub id: String,
    pub user_id: i64,
    pub summary_text: String,
    /// Name of the archived transcript this summary was built from
    pub original_log_ref: String,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
}
