//! Session lifecycle management
//!
//! Keeps at most one active session per user, appends turns to the chat
//! log, runs expiry with summarization, and rebuilds context after the
//! backend forgets a remote session.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::HostConfig;
use crate::error::Result;
use crate::llm::{LlmBackend, Usage};
use crate::store::{load_json, save_json, PathLocks, UserPaths};

use super::chat_log::{ChatLogger, ChatRole, ENTRY_SEPARATOR};
use super::types::{ChatSummary, ExpiryReason, Session};

/// Characters of chat log included in a recovered context block
const CONTEXT_TAIL_CHARS: usize = 8000;
/// Summaries included in a recovered context block
const CONTEXT_SUMMARY_COUNT: usize = 3;
/// Turns kept from each end in the fallback summary
const FALLBACK_TURNS: usize = 3;

/// Manages the per-user active session pointer
pub struct SessionManager {
    paths: UserPaths,
    locks: Arc<PathLocks>,
    clock: Arc<dyn Clock>,
    backend: Arc<dyn LlmBackend>,
    chat_logger: ChatLogger,
    timeout_seconds: u64,
    stale_seconds: u64,
    sessions: tokio::sync::RwLock<HashMap<i64, Session>>,
    /// One expiry in flight per user; concurrent attempts wait on it
    expiries: std::sync::Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionManager {
    pub fn new(
        config: &HostConfig,
        paths: UserPaths,
        locks: Arc<PathLocks>,
        clock: Arc<dyn Clock>,
        backend: Arc<dyn LlmBackend>,
    ) -> Result<Self> {
        let sessions: HashMap<i64, Session> =
            load_json(paths.sessions_file())?.unwrap_or_default();
        Ok(Self {
            chat_logger: ChatLogger::new(paths.clone()),
            paths,
            locks,
            clock,
            backend,
            timeout_seconds: config.session_timeout_seconds,
            stale_seconds: config.context_stale_seconds,
            sessions: tokio::sync::RwLock::new(sessions),
            expiries: std::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn chat_logger(&self) -> &ChatLogger {
        &self.chat_logger
    }

    /// Return the active session for a user, expiring a timed-out one and
    /// creating a fresh session when none is active
    pub async fn open_or_resume(&self, user_id: i64) -> Result<Session> {
        let now = self.clock.now_utc();

        let expired = {
            let sessions = self.sessions.read().await;
            match sessions.get(&user_id) {
                Some(session) if !session.is_expired(self.timeout_seconds, now) => {
                    return Ok(session.clone());
                }
                Some(_) => true,
                None => false,
            }
        };

        if expired {
            self.expire(user_id, ExpiryReason::Timeout).await?;
        }

        let mut sessions = self.sessions.write().await;
        // A concurrent caller may have opened one while we were expiring
        if let Some(session) = sessions.get(&user_id) {
            if !session.is_expired(self.timeout_seconds, now) {
                return Ok(session.clone());
            }
        }
        let session = Session::new(user_id, now);
        info!(user_id, session_id = %session.id, "new session opened");
        sessions.insert(user_id, session.clone());
        self.persist(&sessions).await?;
        Ok(session)
    }

    /// Current session without side effects
    pub async fn get(&self, user_id: i64) -> Option<Session> {
        self.sessions.read().await.get(&user_id).cloned()
    }

    /// Append a turn to the chat log and update session accounting
    pub async fn record_turn(
        &self,
        user_id: i64,
        role: ChatRole,
        body: &str,
        usage: Option<Usage>,
    ) -> Result<()> {
        let now = self.clock.now_utc();
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&user_id)
            .ok_or(crate::error::Error::SessionNotFound(user_id))?;

        self.chat_logger
            .append(user_id, &session.id, role, body, now)?;

        session.last_activity = now;
        session.message_count += 1;
        if role == ChatRole::Assistant {
            session.turns += 1;
        }
        if let Some(usage) = usage {
            session.input_tokens += usage.input_tokens;
            session.output_tokens += usage.output_tokens;
            session.cost_usd += usage.cost_usd;
        }
        self.persist(&sessions).await
    }

    /// Store the remote session token returned by the backend
    pub async fn set_remote_id(&self, user_id: i64, remote_id: Option<String>) -> Result<()> {
        if remote_id.is_none() {
            return Ok(());
        }
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(&user_id) {
            session.remote_id = remote_id;
            self.persist(&sessions).await?;
        }
        Ok(())
    }

    /// Close the user's session: summarize the transcript, archive it, and
    /// clear the active pointer. A failed summarization falls back to a
    /// deterministic excerpt so expiry always completes.
    pub async fn expire(&self, user_id: i64, reason: ExpiryReason) -> Result<Option<ChatSummary>> {
        let gate = self.expiry_gate(user_id);
        let _in_flight = gate.lock().await;

        let session = {
            let sessions = self.sessions.read().await;
            match sessions.get(&user_id) {
                Some(session) => session.clone(),
                // A concurrent expiry already completed
                None => return Ok(None),
            }
        };

        info!(user_id, session_id = %session.id, reason = reason.as_str(), "expiring session");

        let transcript = self
            .chat_logger
            .read(user_id, &session.id)
            .unwrap_or_default();

        let summary_text = if transcript.trim().is_empty() {
            format!("Session closed ({}) with no recorded turns.", reason.as_str())
        } else {
            match self.backend.summarize(&transcript).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(user_id, "summarization failed, using fallback: {}", e);
                    fallback_summary(&session, &transcript)
                }
            }
        };

        let summary = self.chat_logger.archive(
            user_id,
            &session.id,
            &summary_text,
            session.created_at,
            self.clock.now_utc(),
        )?;

        {
            let mut sessions = self.sessions.write().await;
            sessions.remove(&user_id);
            self.persist(&sessions).await?;
        }
        Ok(Some(summary))
    }

    /// True when the session exists but has been quiet longer than the
    /// stale threshold
    pub async fn is_stale(&self, user_id: i64) -> bool {
        let now = self.clock.now_utc();
        let sessions = self.sessions.read().await;
        sessions
            .get(&user_id)
            .map(|s| now - s.last_activity > Duration::seconds(self.stale_seconds as i64))
            .unwrap_or(false)
    }

    /// Build the context block used to re-seed the backend after a stale
    /// gap or a forgotten remote session: recent summaries plus the tail
    /// of the current transcript
    pub async fn recover_context(&self, user_id: i64) -> String {
        let mut block = String::new();

        let summaries = self
            .chat_logger
            .recent_summaries(user_id, CONTEXT_SUMMARY_COUNT);
        if !summaries.is_empty() {
            block.push_str("## Previous conversation summaries\n");
            for summary in summaries.iter().rev() {
                block.push_str(&format!("\n[{}]\n{}\n", summary.id, summary.summary_text));
            }
        }

        let session = self.sessions.read().await.get(&user_id).cloned();
        if let Some(session) = session {
            if let Some(tail) = self
                .chat_logger
                .tail(user_id, &session.id, CONTEXT_TAIL_CHARS)
            {
                block.push_str("\n## Current conversation\n");
                block.push_str(&tail);
            }
        }
        block
    }

    fn expiry_gate(&self, user_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut expiries = self.expiries.lock().unwrap();
        expiries
            .entry(user_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn persist(&self, sessions: &HashMap<i64, Session>) -> Result<()> {
        let path = self.paths.sessions_file();
        let _guard = self.locks.lock(&path).await;
        save_json(&path, sessions)
    }
}

/// Deterministic summary used when the backend cannot summarize: the first
/// and last few entries plus aggregate stats
fn fallback_summary(session: &Session, transcript: &str) -> String {
    let entries: Vec<&str> = transcript
        .split(ENTRY_SEPARATOR)
        .map(str::trim)
        .filter(|e| !e.is_empty() && !e.starts_with("# chat transcript"))
        .collect();

    let mut parts = Vec::new();
    if entries.len() <= FALLBACK_TURNS * 2 {
        parts.extend(entries.iter().copied());
    } else {
        parts.extend(entries[..FALLBACK_TURNS].iter().copied());
        parts.push("[... middle of conversation omitted ...]");
        parts.extend(entries[entries.len() - FALLBACK_TURNS..].iter().copied());
    }

    format!(
        "Automatic excerpt (summarizer unavailable).\n\
         Messages: {}, turns: {}, tokens: {} in / {} out, cost: ${:.4}\n\n{}",
        session.message_count,
        session.turns,
        session.input_tokens,
        session.output_tokens,
        session.cost_usd,
        parts.join("\n\n")
    )
}
