//! Deterministic per-user directory layout
//!
//! ```text
//! <root>/users.json
//! <root>/sessions.json
//! <root>/users/<id>/data/                   working directory (user-visible)
//! <root>/users/<id>/data/chat_logs/
//! <root>/users/<id>/data/chat_summaries/
//! <root>/users/<id>/data/memories.json
//! <root>/users/<id>/data/schedules/tasks.json
//! <root>/users/<id>/data/schedules/operation_log.jsonl
//! <root>/users/<id>/data/running_tasks/
//! <root>/users/<id>/data/completed_tasks/
//! <root>/users/<id>/data/review_logs/
//! ```

use std::path::{Path, PathBuf};

use crate::error::Result;

/// Resolver for the per-user file layout
#[derive(Debug, Clone)]
pub struct UserPaths {
    root: PathBuf,
}

impl UserPaths {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Shared registry of all users
    pub fn users_file(&self) -> PathBuf {
        self.root.join("users.json")
    }

    /// Shared map of active sessions
    pub fn sessions_file(&self) -> PathBuf {
        self.root.join("sessions.json")
    }

    pub fn user_dir(&self, user_id: i64) -> PathBuf {
        self.root.join("users").join(user_id.to_string())
    }

    /// The user's working directory; all user-visible files live under here
    pub fn data_dir(&self, user_id: i64) -> PathBuf {
        self.user_dir(user_id).join("data")
    }

    pub fn chat_logs_dir(&self, user_id: i64) -> PathBuf {
        self.data_dir(user_id).join("chat_logs")
    }

    pub fn chat_summaries_dir(&self, user_id: i64) -> PathBuf {
        self.data_dir(user_id).join("chat_summaries")
    }

    pub fn memories_file(&self, user_id: i64) -> PathBuf {
        self.data_dir(user_id).join("memories.json")
    }

    pub fn schedules_dir(&self, user_id: i64) -> PathBuf {
        self.data_dir(user_id).join("schedules")
    }

    pub fn schedule_tasks_file(&self, user_id: i64) -> PathBuf {
        self.schedules_dir(user_id).join("tasks.json")
    }

    pub fn operation_log_file(&self, user_id: i64) -> PathBuf {
        self.schedules_dir(user_id).join("operation_log.jsonl")
    }

    pub fn running_tasks_dir(&self, user_id: i64) -> PathBuf {
        self.data_dir(user_id).join("running_tasks")
    }

    /// Authoritative history of finished tasks
    pub fn completed_tasks_dir(&self, user_id: i64) -> PathBuf {
        self.data_dir(user_id).join("completed_tasks")
    }

    pub fn review_logs_dir(&self, user_id: i64) -> PathBuf {
        self.data_dir(user_id).join("review_logs")
    }

    /// Scratch space cleaned after every tracked task
    pub fn temp_dir(&self, user_id: i64) -> PathBuf {
        self.data_dir(user_id).join("temp")
    }

    /// Create the directory skeleton for a user
    pub fn ensure_user_layout(&self, user_id: i64) -> Result<PathBuf> {
        let data = self.data_dir(user_id);
        for dir in [
            data.clone(),
            self.chat_logs_dir(user_id),
            self.chat_summaries_dir(user_id),
            self.schedules_dir(user_id),
            self.running_tasks_dir(user_id),
            self.completed_tasks_dir(user_id),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let paths = UserPaths::new("/srv/agentd");
        assert_eq!(
            paths.memories_file(42),
            PathBuf::from("/srv/agentd/users/42/data/memories.json")
        );
        assert_eq!(
            paths.operation_log_file(42),
            PathBuf::from("/srv/agentd/users/42/data/schedules/operation_log.jsonl")
        );
        assert_eq!(paths.users_file(), PathBuf::from("/srv/agentd/users.json"));
    }

    #[test]
    fn test_ensure_user_layout() {
        let dir = tempfile::tempdir().unwrap();
        let paths = UserPaths::new(dir.path());
        let data = paths.ensure_user_layout(7).unwrap();
        assert!(data.is_dir());
        assert!(paths.completed_tasks_dir(7).is_dir());
    }
}
