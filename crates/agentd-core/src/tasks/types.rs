//! Sub-agent task types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Longest rejected-result excerpt kept in retry history
const RESULT_SUMMARY_CHARS: usize = 500;

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// One rejected attempt in a task's review history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryRecord {
    pub attempt: u32,
    /// Excerpt of the rejected result
    pub result_summary: String,
    pub feedback: String,
    pub suggestions: Vec<String>,
    pub missing_dimensions: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// A delegated unit of work executed under the concurrency cap
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentTask {
    pub task_id: String,
    pub user_id: i64,
    pub description: String,
    pub prompt: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Quality criteria; present only for reviewed tasks
    pub review_criteria: Option<String>,
    pub retry_history: Vec<RetryRecord>,
    /// Working-directory-relative paths delivered to the user
    pub files_produced: Vec<String>,
    pub result: Option<String>,
    pub error: Option<String>,
    /// Set when the review loop exhausted its retries
    pub max_retries_reached: bool,
}

impl SubAgentTask {
    pub fn new(
        user_id: i64,
        description: impl Into<String>,
        prompt: impl Into<String>,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: generate_task_id(),
            user_id,
            description: description.into(),
            prompt: prompt.into(),
            status: TaskStatus::Pending,
            created_at: now,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries,
            review_criteria: None,
            retry_history: Vec::new(),
            files_produced: Vec::new(),
            result: None,
            error: None,
            max_retries_reached: false,
        }
    }

    pub fn with_review_criteria(mut self, criteria: impl Into<String>) -> Self {
        self.review_criteria = Some(criteria.into());
        self
    }

    /// Record a rejection, truncating the rejected result to an excerpt
    pub fn add_retry_record(
        &mut self,
        result: &str,
        feedback: String,
        suggestions: Vec<String>,
        missing_dimensions: Vec<String>,
        now: DateTime<Utc>,
    ) {
        let result_summary = if result.chars().count() > RESULT_SUMMARY_CHARS {
            result.chars().take(RESULT_SUMMARY_CHARS).collect()
        } else {
            result.to_string()
        };
        self.retry_history.push(RetryRecord {
            attempt: self.retry_count + 1,
            result_summary,
            feedback,
            suggestions,
            missing_dimensions,
            timestamp: now,
        });
    }
}

fn generate_task_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}
