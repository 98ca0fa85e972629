//! Chat transcript logging
//!
//! Transcripts are human-readable append-only text files, one per session.
//! On expiry the transcript is folded into a summary file under
//! `chat_summaries/` and the live log is removed.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::Result;
use crate::store::UserPaths;

use super::types::ChatSummary;

pub(crate) const ENTRY_SEPARATOR: &str =
    "============================================================";
const TRANSCRIPT_MARKER: &str = "--- original transcript ---";

/// Role of one transcript entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "User",
            ChatRole::Assistant => "Agent",
            ChatRole::System => "System",
        }
    }
}

/// Writes and archives per-session transcripts
#[derive(Clone)]
pub struct ChatLogger {
    paths: UserPaths,
}

impl ChatLogger {
    pub fn new(paths: UserPaths) -> Self {
        Self { paths }
    }

    /// Append one entry to the session's transcript, creating the file with
    /// a header block on first write
    pub fn append(
        &self,
        user_id: i64,
        session_id: &str,
        role: ChatRole,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let path = self.log_file(user_id, session_id, now)?;
        let is_new = !path.exists();

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if is_new {
            writeln!(file, "# chat transcript")?;
            writeln!(file, "# user: {}", user_id)?;
            writeln!(file, "# session: {}", session_id)?;
            writeln!(file, "# started: {}", now.to_rfc3339())?;
        }
        writeln!(file, "\n{}", ENTRY_SEPARATOR)?;
        writeln!(file, "[{}]", now.format("%Y-%m-%d %H:%M:%S"))?;
        writeln!(file, "{}:", role.as_str())?;
        writeln!(file, "{}", body)?;
        Ok(())
    }

    /// Full transcript of the session, if any
    pub fn read(&self, user_id: i64, session_id: &str) -> Option<String> {
        let path = self.find_log_file(user_id, session_id)?;
        std::fs::read_to_string(path).ok()
    }

    /// Last `max_chars` characters of the transcript
    pub fn tail(&self, user_id: i64, session_id: &str, max_chars: usize) -> Option<String> {
        let text = self.read(user_id, session_id)?;
        if text.chars().count() <= max_chars {
            return Some(text);
        }
        let skip = text.chars().count() - max_chars;
        Some(text.chars().skip(skip).collect())
    }

    /// Archive the session: write the summary plus the full transcript into
    /// `chat_summaries/` and delete the live log
    pub fn archive(
        &self,
        user_id: i64,
        session_id: &str,
        summary: &str,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> Result<ChatSummary> {
        let summaries_dir = self.paths.chat_summaries_dir(user_id);
        std::fs::create_dir_all(&summaries_dir)?;

        let stem = format!("summary_{}", range_end.format("%Y%m%d_%H%M%S"));
        let summary_path = summaries_dir.join(format!("{}.txt", stem));

        let log_path = self.find_log_file(user_id, session_id);
        let log_name = log_path
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let mut content = String::new();
        content.push_str("# chat summary\n");
        content.push_str(&format!("# session: {}\n", session_id));
        content.push_str(&format!("# from: {}\n", range_start.to_rfc3339()));
        content.push_str(&format!("# to: {}\n", range_end.to_rfc3339()));
        content.push_str(&format!("# log: {}\n\n", log_name));
        content.push_str(summary);
        content.push('\n');

        if let Some(log_path) = &log_path {
            if let Ok(transcript) = std::fs::read_to_string(log_path) {
                content.push_str(&format!("\n{}\n", TRANSCRIPT_MARKER));
                content.push_str(&transcript);
            }
            if let Err(e) = std::fs::remove_file(log_path) {
                warn!(user_id, "failed to remove archived log: {}", e);
            }
        }

        std::fs::write(&summary_path, &content)?;
        info!(user_id, session_id, summary = %summary_path.display(), "session archived");

        Ok(ChatSummary {
            id: stem,
            user_id,
            summary_text: summary.to_string(),
            original_log_ref: log_name,
            range_start,
            range_end,
        })
    }

    /// Most recent summaries, newest first
    pub fn recent_summaries(&self, user_id: i64, limit: usize) -> Vec<ChatSummary> {
        let dir = self.paths.chat_summaries_dir(user_id);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };

        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.extension().map(|e| e == "txt").unwrap_or(false)
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.starts_with("summary_"))
                        .unwrap_or(false)
            })
            .collect();
        files.sort_by_key(|p| {
            std::cmp::Reverse(
                p.metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH),
            )
        });

        files
            .into_iter()
            .take(limit)
            .filter_map(|path| parse_summary_file(user_id, &path))
            .collect()
    }

    /// Remove transcripts and summaries older than `keep_days`
    pub fn cleanup_old_logs(&self, user_id: i64, keep_days: i64) -> usize {
        let cutoff = std::time::SystemTime::now()
            - std::time::Duration::from_secs(keep_days.max(0) as u64 * 86_400);
        let mut removed = 0;

        for dir in [
            self.paths.chat_logs_dir(user_id),
            self.paths.chat_summaries_dir(user_id),
        ] {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let old = path
                    .metadata()
                    .and_then(|m| m.modified())
                    .map(|m| m < cutoff)
                    .unwrap_or(false);
                if old && std::fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!(user_id, removed, "cleaned up old chat logs");
        }
        removed
    }

    fn log_file(&self, user_id: i64, session_id: &str, now: DateTime<Utc>) -> Result<PathBuf> {
        if let Some(existing) = self.find_log_file(user_id, session_id) {
            return Ok(existing);
        }
        let dir = self.paths.chat_logs_dir(user_id);
        std::fs::create_dir_all(&dir)?;
        let short = &session_id[..session_id.len().min(8)];
        Ok(dir.join(format!("chat_{}_{}.txt", now.format("%Y%m%d_%H%M%S"), short)))
    }

    fn find_log_file(&self, user_id: i64, session_id: &str) -> Option<PathBuf> {
        let short = &session_id[..session_id.len().min(8)];
        let suffix = format!("_{}.txt", short);
        let entries = std::fs::read_dir(self.paths.chat_logs_dir(user_id)).ok()?;
        entries
            .flatten()
            .map(|e| e.path())
            .find(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.ends_with(&suffix))
                    .unwrap_or(false)
            })
    }
}

fn parse_summary_file(user_id: i64, path: &std::path::Path) -> Option<ChatSummary> {
    let text = std::fs::read_to_string(path).ok()?;
    let stem = path.file_stem()?.to_str()?.to_string();

    let mut log_ref = String::new();
    let mut range_start = None;
    let mut range_end = None;
    let mut body = Vec::new();

    for line in text.lines() {
        if line == TRANSCRIPT_MARKER {
            break;
        }
        if let Some(value) = line.strip_prefix("# from: ") {
            range_start = DateTime::parse_from_rfc3339(value.trim())
                .ok()
                .map(|d| d.with_timezone(&Utc));
        } else if let Some(value) = line.strip_prefix("# to: ") {
            range_end = DateTime::parse_from_rfc3339(value.trim())
                .ok()
                .map(|d| d.with_timezone(&Utc));
        } else if let Some(value) = line.strip_prefix("# log: ") {
            log_ref = value.trim().to_string();
        } else if !line.starts_with('#') {
            body.push(line);
        }
    }

    Some(ChatSummary {
        id: stem,
        user_id,
        summary_text: body.join("\n").trim().to_string(),
        original_log_ref: log_ref,
        range_start: range_start.unwrap_or_else(Utc::now),
        range_end: range_end.unwrap_or_else(Utc::now),
    })
}
