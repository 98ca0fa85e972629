//! Sub-agent task manager
//!
//! Runs delegated tasks under a global concurrency cap with FIFO admission,
//! wraps every attempt in a file tracker scope, and drives the review loop
//! for quality-gated tasks. Each task publishes its lifecycle transitions
//! from a single context, which keeps per-task event order intact.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::adapter::Outbox;
use crate::clock::Clock;
use crate::config::HostConfig;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::llm::{LlmBackend, LlmRequest};
use crate::store::UserPaths;
use crate::tracker::{deliver_tracked_files, FileTrackerScope};

use super::review::{ReviewAgent, ReviewVerdict};
use super::types::{SubAgentTask, TaskStatus};

/// Longest result excerpt written into a task document
const DOC_RESULT_CHARS: usize = 5000;
/// Longest result excerpt kept in a review log entry
const LOG_RESULT_CHARS: usize = 2000;

/// Executes delegated tasks for all users
pub struct TaskManager {
    inner: Arc<Inner>,
}

struct Inner {
    paths: UserPaths,
    outbox: Arc<Outbox>,
    bus: Arc<EventBus>,
    backend: Arc<dyn LlmBackend>,
    review: ReviewAgent,
    clock: Arc<dyn Clock>,
    /// Global cap; tokio's semaphore queues waiters FIFO
    permits: Arc<Semaphore>,
    max_retries: u32,
    inline_threshold: usize,
    tasks: std::sync::Mutex<HashMap<String, SubAgentTask>>,
    cancels: std::sync::Mutex<HashMap<String, CancellationToken>>,
    /// Parent token; cancelling it cancels every task
    shutdown: CancellationToken,
}

impl TaskManager {
    pub fn new(
        config: &HostConfig,
        paths: UserPaths,
        outbox: Arc<Outbox>,
        bus: Arc<EventBus>,
        backend: Arc<dyn LlmBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                paths,
                outbox,
                bus,
                review: ReviewAgent::new(backend.clone()),
                backend,
                clock,
                permits: Arc::new(Semaphore::new(config.max_sub_agents.max(1))),
                max_retries: config.max_retries,
                inline_threshold: config.inline_file_threshold,
                tasks: std::sync::Mutex::new(HashMap::new()),
                cancels: std::sync::Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Enqueue a simple task; returns its id immediately
    pub fn delegate(
        &self,
        user_id: i64,
        description: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Result<String> {
        self.submit(user_id, description.into(), prompt.into(), None)
    }

    /// Enqueue a task whose result must pass review before delivery
    pub fn delegate_and_review(
        &self,
        user_id: i64,
        description: impl Into<String>,
        prompt: impl Into<String>,
        review_criteria: impl Into<String>,
    ) -> Result<String> {
        self.submit(
            user_id,
            description.into(),
            prompt.into(),
            Some(review_criteria.into()),
        )
    }

    fn submit(
        &self,
        user_id: i64,
        description: String,
        prompt: String,
        review_criteria: Option<String>,
    ) -> Result<String> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::Validation("host is shutting down".to_string()));
        }
        if description.trim().is_empty() {
            return Err(Error::Validation("task description is empty".to_string()));
        }
        if prompt.trim().is_empty() {
            return Err(Error::Validation("task prompt is empty".to_string()));
        }

        let now = self.inner.clock.now_utc();
        let mut task = SubAgentTask::new(user_id, description, prompt, self.inner.max_retries, now);
        if let Some(criteria) = review_criteria {
            task = task.with_review_criteria(criteria);
        }
        let task_id = task.task_id.clone();
        let cancel = self.inner.shutdown.child_token();

        self.inner.write_running_document(&task);
        self.inner
            .bus
            .broadcast_task_created(user_id, &task_id, &task.description);
        info!(user_id, task_id = %task_id, "sub-agent task created");

        {
            self.inner
                .tasks
                .lock()
                .unwrap()
                .insert(task_id.clone(), task);
            self.inner
                .cancels
                .lock()
                .unwrap()
                .insert(task_id.clone(), cancel.clone());
        }

        let inner = self.inner.clone();
        let spawned_id = task_id.clone();
        tokio::spawn(async move {
            inner.run_task(spawned_id, cancel).await;
        });

        Ok(task_id)
    }

    /// Best-effort cancellation of a pending or running task
    pub fn cancel(&self, task_id: &str) -> Result<()> {
        let cancel = self
            .inner
            .cancels
            .lock()
            .unwrap()
            .get(task_id)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
        cancel.cancel();
        info!(task_id, "cancellation requested");
        Ok(())
    }

    pub fn get(&self, task_id: &str) -> Option<SubAgentTask> {
        self.inner.tasks.lock().unwrap().get(task_id).cloned()
    }

    /// All tasks for a user, newest first
    pub fn list(&self, user_id: i64) -> Vec<SubAgentTask> {
        let tasks = self.inner.tasks.lock().unwrap();
        let mut list: Vec<SubAgentTask> = tasks
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    /// Number of tasks currently in RUNNING state
    pub fn running_count(&self) -> usize {
        self.inner
            .tasks
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .count()
    }

    /// Task counts by status for one user
    pub fn status_summary(&self, user_id: i64) -> HashMap<&'static str, usize> {
        let tasks = self.inner.tasks.lock().unwrap();
        let mut summary = HashMap::new();
        for task in tasks.values().filter(|t| t.user_id == user_id) {
            *summary.entry(task.status.as_str()).or_default() += 1;
        }
        summary
    }

    /// Refuse new admissions and cancel everything in flight. Pending tasks
    /// end as `cancelled`.
    pub fn shutdown(&self) {
        info!("task manager shutting down");
        self.inner.shutdown.cancel();
    }

    /// Drop terminal tasks older than `max_age_seconds` from the index
    pub fn cleanup_old_tasks(&self, max_age_seconds: i64) -> usize {
        let now = self.inner.clock.now_utc();
        let mut tasks = self.inner.tasks.lock().unwrap();
        let before = tasks.len();
        tasks.retain(|_, task| {
            !(task.status.is_terminal()
                && (now - task.created_at).num_seconds() > max_age_seconds)
        });
        before - tasks.len()
    }

    /// Remove completed-task documents older than `max_age_days`
    pub fn cleanup_old_task_documents(&self, user_id: i64, max_age_days: u64) -> usize {
        let dir = self.inner.paths.completed_tasks_dir(user_id);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return 0;
        };
        let cutoff = std::time::SystemTime::now()
            - std::time::Duration::from_secs(max_age_days * 86_400);
        let mut removed = 0;
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
        if removed > 0 {
            info!(user_id, removed, "cleaned up old task documents");
        }
        removed
    }
}

impl Inner {
    async fn run_task(&self, task_id: String, cancel: CancellationToken) {
        if cancel.is_cancelled() {
            self.finish(&task_id, TaskStatus::Cancelled, None, Some("cancelled before start"));
            return;
        }

        let reviewed = self
            .with_task(&task_id, |t| t.review_criteria.is_some())
            .unwrap_or(false);

        let outcome = if reviewed {
            self.run_review_loop(&task_id, &cancel).await
        } else {
            self.run_once(&task_id, &cancel).await
        };

        if let Err(e) = outcome {
            error!(task_id = %task_id, "task execution error: {}", e);
        }
        self.cancels.lock().unwrap().remove(&task_id);
    }

    /// Plain task: one execution, artifacts delivered on success
    async fn run_once(&self, task_id: &str, cancel: &CancellationToken) -> Result<()> {
        let Some(_permit) = self.admit(task_id, cancel).await else {
            return Ok(());
        };
        let (user_id, prompt) = match self.mark_running(task_id) {
            Some(parts) => parts,
            None => return Ok(()),
        };

        let tracker = self.start_tracker(user_id);

        let request = LlmRequest::new(prompt).with_cancel(cancel.clone());
        match self.backend.invoke(request).await {
            Ok(reply) if cancel.is_cancelled() => {
                // Result discarded, files never delivered
                drop(reply);
                self.finish(task_id, TaskStatus::Cancelled, None, Some("cancelled"));
            }
            Ok(reply) => {
                let result = self
                    .deliver_artifacts(task_id, user_id, tracker.as_ref(), reply.text)
                    .await;
                self.finish(task_id, TaskStatus::Completed, Some(result.clone()), None);
                self.outbox.send_text(user_id, &result).await;
            }
            Err(_) if cancel.is_cancelled() => {
                self.finish(task_id, TaskStatus::Cancelled, None, Some("cancelled"));
            }
            Err(e) => {
                self.finish(task_id, TaskStatus::Failed, None, Some(&e.to_string()));
                self.outbox
                    .send_text(user_id, &format!("Task failed: {}", e))
                    .await;
            }
        }
        Ok(())
    }

    /// Reviewed task: execute, evaluate, retry with accumulated feedback
    async fn run_review_loop(&self, task_id: &str, cancel: &CancellationToken) -> Result<()> {
        let mut review_log: Vec<ReviewLogEntry> = Vec::new();
        let mut first_attempt = true;

        loop {
            let Some(_permit) = self.admit(task_id, cancel).await else {
                return Ok(());
            };

            let (user_id, criteria, description, attempt) = {
                let tasks = self.tasks.lock().unwrap();
                let Some(task) = tasks.get(task_id) else {
                    return Ok(());
                };
                (
                    task.user_id,
                    task.review_criteria.clone().unwrap_or_default(),
                    task.description.clone(),
                    task.retry_count + 1,
                )
            };

            let prompt = match self.mark_running_reviewed(task_id, first_attempt) {
                Some(prompt) => prompt,
                None => return Ok(()),
            };
            first_attempt = false;

            // Fresh tracker per attempt: only the accepted attempt's files
            // are delivered
            let tracker = self.start_tracker(user_id);

            let request = LlmRequest::new(prompt).with_cancel(cancel.clone());
            let reply = match self.backend.invoke(request).await {
                Ok(reply) if cancel.is_cancelled() => {
                    drop(reply);
                    self.finish(task_id, TaskStatus::Cancelled, None, Some("cancelled"));
                    return Ok(());
                }
                Ok(reply) => reply,
                Err(_) if cancel.is_cancelled() => {
                    self.finish(task_id, TaskStatus::Cancelled, None, Some("cancelled"));
                    return Ok(());
                }
                Err(e) => {
                    self.finish(task_id, TaskStatus::Failed, None, Some(&e.to_string()));
                    self.outbox
                        .send_text(user_id, &format!("Task failed: {}", e))
                        .await;
                    return Ok(());
                }
            };

            let verdict = self
                .review
                .evaluate(
                    &description,
                    &reply.text,
                    &criteria,
                    attempt,
                    self.clock.now_utc().date_naive(),
                )
                .await;

            match verdict {
                ReviewVerdict::Accept { feedback } => {
                    review_log.push(ReviewLogEntry::passed(attempt, &reply.text, feedback));
                    let result = self
                        .deliver_artifacts(task_id, user_id, tracker.as_ref(), reply.text)
                        .await;
                    self.finish(task_id, TaskStatus::Completed, Some(result.clone()), None);

                    let mut notice = "Task completed".to_string();
                    if review_log.len() > 1 {
                        notice = format!("Task completed after {} attempts", review_log.len());
                        self.save_and_send_review_log(user_id, task_id, &description, &review_log)
                            .await;
                    }
                    self.outbox.send_text(user_id, &notice).await;
                    self.outbox.send_text(user_id, &result).await;
                    return Ok(());
                }
                ReviewVerdict::Reject {
                    feedback,
                    suggestions,
                    missing_dimensions,
                } => {
                    review_log.push(ReviewLogEntry::rejected(
                        attempt,
                        &reply.text,
                        feedback.clone(),
                        suggestions.clone(),
                        missing_dimensions.clone(),
                    ));

                    let exhausted = {
                        let mut tasks = self.tasks.lock().unwrap();
                        let Some(task) = tasks.get_mut(task_id) else {
                            return Ok(());
                        };
                        task.add_retry_record(
                            &reply.text,
                            feedback,
                            suggestions,
                            missing_dimensions,
                            self.clock.now_utc(),
                        );
                        task.retry_count += 1;
                        task.retry_count >= task.max_retries
                    };

                    if exhausted {
                        // Out of retries: the last result ships anyway,
                        // flagged, with the review log attached
                        let result = self
                            .deliver_artifacts(task_id, user_id, tracker.as_ref(), reply.text)
                            .await;
                        {
                            let mut tasks = self.tasks.lock().unwrap();
                            if let Some(task) = tasks.get_mut(task_id) {
                                task.max_retries_reached = true;
                            }
                        }
                        self.finish(task_id, TaskStatus::Completed, Some(result.clone()), None);
                        self.save_and_send_review_log(user_id, task_id, &description, &review_log)
                            .await;
                        self.outbox
                            .send_text(
                                user_id,
                                &format!(
                                    "Task completed after {} attempts (review log attached)",
                                    review_log.len()
                                ),
                            )
                            .await;
                        self.outbox.send_text(user_id, &result).await;
                        return Ok(());
                    }

                    // Rejections stay internal; re-queue silently
                    info!(
                        task_id,
                        attempt, "review rejected result, re-queueing task"
                    );
                    self.with_task(task_id, |task| task.status = TaskStatus::Pending);
                }
            }
            // Permit dropped here; the retry waits its turn in FIFO order
        }
    }

    /// Wait for a permit under the global cap, honoring cancellation
    async fn admit(
        &self,
        task_id: &str,
        cancel: &CancellationToken,
    ) -> Option<tokio::sync::OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.finish(task_id, TaskStatus::Cancelled, None, Some("cancelled while pending"));
                None
            }
            permit = self.permits.clone().acquire_owned() => match permit {
                Ok(permit) => Some(permit),
                Err(_) => {
                    self.finish(task_id, TaskStatus::Cancelled, None, Some("admission closed"));
                    None
                }
            },
        }
    }

    fn mark_running(&self, task_id: &str) -> Option<(i64, String)> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.get_mut(task_id)?;
        task.status = TaskStatus::Running;
        task.started_at = Some(self.clock.now_utc());
        let parts = (task.user_id, task.prompt.clone());
        let user_id = task.user_id;
        drop(tasks);
        self.bus
            .broadcast_task_update(user_id, task_id, "running", None);
        Some(parts)
    }

    /// Mark a reviewed attempt running and build its prompt with the retry
    /// history appended. The running event is published once per task.
    fn mark_running_reviewed(&self, task_id: &str, first_attempt: bool) -> Option<String> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.get_mut(task_id)?;
        task.status = TaskStatus::Running;
        if task.started_at.is_none() {
            task.started_at = Some(self.clock.now_utc());
        }
        let prompt = build_attempt_prompt(task);
        let user_id = task.user_id;
        drop(tasks);
        if first_attempt {
            self.bus
                .broadcast_task_update(user_id, task_id, "running", None);
        }
        Some(prompt)
    }

    fn start_tracker(&self, user_id: i64) -> Option<FileTrackerScope> {
        match FileTrackerScope::start(self.paths.data_dir(user_id)) {
            Ok(tracker) => Some(tracker),
            Err(e) => {
                warn!(user_id, "file tracker unavailable: {}", e);
                None
            }
        }
    }

    /// Diff the tracker, deliver new files, clean temp, and fold the file
    /// list into the result text
    async fn deliver_artifacts(
        &self,
        task_id: &str,
        user_id: i64,
        tracker: Option<&FileTrackerScope>,
        result: String,
    ) -> String {
        let Some(tracker) = tracker else {
            return result;
        };
        let files = tracker.diff();
        tracker.cleanup_temp();
        if files.is_empty() {
            return result;
        }

        let delivered = match deliver_tracked_files(
            &self.outbox,
            user_id,
            tracker.root(),
            &files,
            self.inline_threshold,
        )
        .await
        {
            Ok(delivered) => delivered,
            Err(e) => {
                error!(user_id, task_id, "file delivery failed: {}", e);
                return result;
            }
        };
        if delivered.is_empty() {
            return result;
        }

        self.with_task(task_id, |task| {
            task.files_produced = delivered.clone();
        });

        let mut listing = delivered
            .iter()
            .take(5)
            .cloned()
            .collect::<Vec<_>>()
            .join(", ");
        if delivered.len() > 5 {
            listing.push_str(&format!(" (+{} more)", delivered.len() - 5));
        }
        format!(
            "{}\n\nGenerated files ({}): {}",
            result,
            delivered.len(),
            listing
        )
    }

    /// Move the task to a terminal state, update its document, and publish
    /// the terminal event
    fn finish(&self, task_id: &str, status: TaskStatus, result: Option<String>, error: Option<&str>) {
        let (user_id, already_terminal) = {
            let mut tasks = self.tasks.lock().unwrap();
            let Some(task) = tasks.get_mut(task_id) else {
                return;
            };
            if task.status.is_terminal() {
                (task.user_id, true)
            } else {
                task.status = status;
                task.completed_at = Some(self.clock.now_utc());
                task.result = result.clone();
                task.error = error.map(str::to_string);
                self.complete_document(task);
                (task.user_id, false)
            }
        };
        if already_terminal {
            return;
        }
        self.bus
            .broadcast_task_update(user_id, task_id, status.as_str(), result);
        info!(user_id, task_id, status = status.as_str(), "task finished");
    }

    fn with_task<R>(&self, task_id: &str, f: impl FnOnce(&mut SubAgentTask) -> R) -> Option<R> {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.get_mut(task_id).map(f)
    }

    /// Create the task document under `running_tasks/`
    fn write_running_document(&self, task: &SubAgentTask) {
        let dir = self.paths.running_tasks_dir(task.user_id);
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!("cannot create running_tasks dir: {}", e);
            return;
        }
        let content = format!(
            "# Task: {}\n\n**Task ID:** {}\n**Status:** {}\n**Created:** {}\n\n\
             ## Instructions\n\n{}\n\n## Progress\n\n_Task is running..._\n",
            task.description,
            task.task_id,
            task.status.as_str(),
            task.created_at.format("%Y-%m-%d %H:%M:%S"),
            task.prompt,
        );
        if let Err(e) = std::fs::write(dir.join(format!("{}.md", task.task_id)), content) {
            warn!(task_id = %task.task_id, "cannot write task document: {}", e);
        }
    }

    /// Rewrite the document with the outcome and move it to
    /// `completed_tasks/`, the authoritative history
    fn complete_document(&self, task: &SubAgentTask) {
        let running = self
            .paths
            .running_tasks_dir(task.user_id)
            .join(format!("{}.md", task.task_id));
        let completed_dir = self.paths.completed_tasks_dir(task.user_id);
        if std::fs::create_dir_all(&completed_dir).is_err() {
            return;
        }

        let mut content = std::fs::read_to_string(&running).unwrap_or_default();
        if let Some(index) = content.find("## Progress") {
            content.truncate(index);
        }

        let stamp = self.clock.now_utc().format("%Y-%m-%d %H:%M:%S");
        match (&task.result, &task.error) {
            (Some(result), _) => {
                let excerpt: String = if result.chars().count() > DOC_RESULT_CHARS {
                    let mut text: String = result.chars().take(DOC_RESULT_CHARS).collect();
                    text.push_str("\n\n... (truncated)");
                    text
                } else {
                    result.clone()
                };
                content.push_str(&format!(
                    "## Result\n\n**Completed:** {}\n**Status:** {}\n\n{}\n",
                    stamp,
                    task.status.as_str(),
                    excerpt
                ));
            }
            (None, Some(error)) => {
                content.push_str(&format!(
                    "## Error\n\n**Failed:** {}\n**Status:** {}\n**Error:** {}\n",
                    stamp,
                    task.status.as_str(),
                    error
                ));
            }
            (None, None) => {
                content.push_str(&format!(
                    "## Completed\n\n**Time:** {}\n**Status:** {}\n",
                    stamp,
                    task.status.as_str()
                ));
            }
        }

        let destination = completed_dir.join(format!("{}.md", task.task_id));
        if std::fs::write(&destination, content).is_ok() {
            let _ = std::fs::remove_file(&running);
        }
    }

    /// Write the per-task review log and send it to the user
    async fn save_and_send_review_log(
        &self,
        user_id: i64,
        task_id: &str,
        description: &str,
        entries: &[ReviewLogEntry],
    ) {
        let dir = self.paths.review_logs_dir(user_id);
        if std::fs::create_dir_all(&dir).is_err() {
            return;
        }
        let path = dir.join(format!("review_{}.md", task_id));

        let mut content = format!(
            "# Review Log: {}\n\n**Task ID:** {}\n**Total Attempts:** {}\n\n---\n\n",
            description,
            task_id,
            entries.len()
        );
        for entry in entries {
            content.push_str(&entry.render());
        }

        if let Err(e) = std::fs::write(&path, content) {
            error!(user_id, task_id, "cannot write review log: {}", e);
            return;
        }
        self.outbox
            .send_file(
                user_id,
                path,
                Some(format!("Review log ({} attempts)", entries.len())),
            )
            .await;
    }
}

/// Original prompt plus the accumulated rejection feedback
fn build_attempt_prompt(task: &SubAgentTask) -> String {
    if task.retry_history.is_empty() {
        return task.prompt.clone();
    }

    let mut prompt = task.prompt.clone();
    prompt.push_str("\n\n## Previous attempts were rejected\n");
    for record in &task.retry_history {
        prompt.push_str(&format!(
            "\n### Attempt {}\nFeedback: {}\n",
            record.attempt, record.feedback
        ));
        if !record.suggestions.is_empty() {
            prompt.push_str("Directions to explore:\n");
            for suggestion in &record.suggestions {
                prompt.push_str(&format!("- {}\n", suggestion));
            }
        }
        if !record.missing_dimensions.is_empty() {
            prompt.push_str("Missing aspects:\n");
            for missing in &record.missing_dimensions {
                prompt.push_str(&format!("- {}\n", missing));
            }
        }
    }
    prompt.push_str("\nAddress all feedback above in this attempt.\n");
    prompt
}

struct ReviewLogEntry {
    attempt: u32,
    passed: bool,
    feedback: String,
    suggestions: Vec<String>,
    missing_dimensions: Vec<String>,
    result_preview: String,
}

impl ReviewLogEntry {
    fn passed(attempt: u32, result: &str, feedback: String) -> Self {
        Self {
            attempt,
            passed: true,
            feedback,
            suggestions: Vec::new(),
            missing_dimensions: Vec::new(),
            result_preview: preview(result),
        }
    }

    fn rejected(
        attempt: u32,
        result: &str,
        feedback: String,
        suggestions: Vec<String>,
        missing_dimensions: Vec<String>,
    ) -> Self {
        Self {
            attempt,
            passed: false,
            feedback,
            suggestions,
            missing_dimensions,
            result_preview: preview(result),
        }
    }

    fn render(&self) -> String {
        let mut text = format!(
            "## Attempt {}\n\n**Status:** {}\n\n",
            self.attempt,
            if self.passed { "PASSED" } else { "REJECTED" }
        );
        if !self.feedback.is_empty() {
            text.push_str(&format!("**Feedback:** {}\n\n", self.feedback));
        }
        if !self.missing_dimensions.is_empty() {
            text.push_str("**Missing Dimensions:**\n");
            for missing in &self.missing_dimensions {
                text.push_str(&format!("- {}\n", missing));
            }
            text.push('\n');
        }
        if !self.suggestions.is_empty() {
            text.push_str("**Improvement Directions:**\n");
            for suggestion in &self.suggestions {
                text.push_str(&format!("- {}\n", suggestion));
            }
            text.push('\n');
        }
        if !self.result_preview.is_empty() {
            text.push_str(&format!("**Result Preview:**\n```\n{}\n```\n\n", self.result_preview));
        }
        text.push_str("---\n\n");
        text
    }
}

fn preview(result: &str) -> String {
    if result.chars().count() > LOG_RESULT_CHARS {
        let mut text: String = result.chars().take(LOG_RESULT_CHARS).collect();
        text.push_str("...");
        text
    } else {
        result.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::tests::RecordingAdapter;
    use crate::clock::SystemClock;
    use crate::events::Event;
    use crate::llm::{LlmError, LlmReply};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Backend whose executions block until released, for cap tests
    struct GatedBackend {
        running: AtomicUsize,
        peak: AtomicUsize,
        release: tokio::sync::Notify,
        hold: std::sync::atomic::AtomicBool,
    }

    impl GatedBackend {
        fn new(hold: bool) -> Self {
            Self {
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                release: tokio::sync::Notify::new(),
                hold: std::sync::atomic::AtomicBool::new(hold),
            }
        }

        fn release_one(&self) {
            self.release.notify_one();
        }
    }

    #[async_trait]
    impl LlmBackend for GatedBackend {
        async fn invoke(&self, request: LlmRequest) -> std::result::Result<LlmReply, LlmError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if self.hold.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = self.release.notified() => {}
                    _ = request.cancel.cancelled() => {
                        self.running.fetch_sub(1, Ordering::SeqCst);
                        return Err(LlmError::Transport("cancelled".to_string()));
                    }
                }
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(LlmReply {
                text: format!("done: {}", request.prompt),
                ..Default::default()
            })
        }

        async fn summarize(&self, _e: &str) -> std::result::Result<String, LlmError> {
            Ok("summary".to_string())
        }
    }

    /// Backend returning a short result; drives review rejections
    struct ShortResultBackend;

    #[async_trait]
    impl LlmBackend for ShortResultBackend {
        async fn invoke(&self, request: LlmRequest) -> std::result::Result<LlmReply, LlmError> {
            // Review prompts are recognizable and must be judged here
            if request.prompt.contains("You are a task quality reviewer") {
                let body: String = request
                    .prompt
                    .split("## Result")
                    .nth(1)
                    .unwrap_or("")
                    .lines()
                    .skip(1)
                    .take_while(|line| !line.starts_with("Judge the result"))
                    .collect::<Vec<_>>()
                    .join("\n");
                let text = if body.trim().len() < 100 {
                    "VERDICT: REJECT\nFEEDBACK: too short\nSUGGESTIONS:\n- expand the analysis\nMISSING:\n- depth"
                } else {
                    "VERDICT: PASS\nFEEDBACK: fine"
                };
                return Ok(LlmReply {
                    text: text.to_string(),
                    ..Default::default()
                });
            }
            Ok(LlmReply {
                text: "short".to_string(),
                ..Default::default()
            })
        }

        async fn summarize(&self, _e: &str) -> std::result::Result<String, LlmError> {
            Ok("summary".to_string())
        }
    }

    struct Fixture {
        manager: TaskManager,
        adapter: Arc<RecordingAdapter>,
        bus: Arc<EventBus>,
        _dir: tempfile::TempDir,
    }

    fn fixture(backend: Arc<dyn LlmBackend>, max_sub_agents: usize, max_retries: u32) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let paths = UserPaths::new(dir.path());
        paths.ensure_user_layout(1).unwrap();

        let mut config = HostConfig::default();
        config.max_sub_agents = max_sub_agents;
        config.max_retries = max_retries;

        let adapter = Arc::new(RecordingAdapter::default());
        let bus = Arc::new(EventBus::default());
        let manager = TaskManager::new(
            &config,
            paths,
            Arc::new(Outbox::new(adapter.clone())),
            bus.clone(),
            backend,
            Arc::new(SystemClock),
        );
        Fixture {
            manager,
            adapter,
            bus,
            _dir: dir,
        }
    }

    async fn wait_for<F: Fn() -> bool>(condition: F, what: &str) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[tokio::test]
    async fn test_concurrent_cap_admission() {
        let backend = Arc::new(GatedBackend::new(true));
        let fx = fixture(backend.clone(), 2, 10);

        let ids: Vec<String> = (0..5)
            .map(|i| {
                fx.manager
                    .delegate(1, format!("task {}", i), format!("prompt {}", i))
                    .unwrap()
            })
            .collect();

        // Two running, three pending
        wait_for(|| fx.manager.running_count() == 2, "two running").await;
        let summary = fx.manager.status_summary(1);
        assert_eq!(summary.get("running"), Some(&2));
        assert_eq!(summary.get("pending"), Some(&3));

        // Completing one admits the next in FIFO order
        backend.release_one();
        wait_for(
            || fx.manager.get(&ids[0]).unwrap().status == TaskStatus::Completed,
            "first completion",
        )
        .await;
        wait_for(|| fx.manager.running_count() == 2, "refill to two").await;

        // Keep releasing until every task has drained through the cap
        for _ in 0..400 {
            backend.release_one();
            let done = ids
                .iter()
                .all(|id| fx.manager.get(id).unwrap().status == TaskStatus::Completed);
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(ids
            .iter()
            .all(|id| fx.manager.get(id).unwrap().status == TaskStatus::Completed));
        assert_eq!(backend.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_event_sequence_per_task() {
        let backend = Arc::new(GatedBackend::new(false));
        let fx = fixture(backend, 2, 10);
        let (_id, mut rx) = fx.bus.subscribe(1);

        let task_id = fx.manager.delegate(1, "demo", "do the thing").unwrap();
        wait_for(
            || fx.manager.get(&task_id).unwrap().status == TaskStatus::Completed,
            "completion",
        )
        .await;

        match rx.recv().await {
            Some(Event::TaskCreated { task_id: id, .. }) => assert_eq!(id, task_id),
            other => panic!("expected task_created, got {:?}", other),
        }
        match rx.recv().await {
            Some(Event::TaskUpdate { status, .. }) => assert_eq!(status, "running"),
            other => panic!("expected running, got {:?}", other),
        }
        match rx.recv().await {
            Some(Event::TaskUpdate { status, .. }) => assert_eq!(status, "completed"),
            other => panic!("expected completed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_review_loop_exhausts_retries() {
        let fx = fixture(Arc::new(ShortResultBackend), 2, 3);

        let task_id = fx
            .manager
            .delegate_and_review(1, "write report", "write it", "at least 100 chars")
            .unwrap();

        wait_for(
            || {
                fx.manager
                    .get(&task_id)
                    .map(|t| t.status == TaskStatus::Completed)
                    .unwrap_or(false)
            },
            "review loop to finish",
        )
        .await;

        let task = fx.manager.get(&task_id).unwrap();
        assert_eq!(task.retry_count, 3);
        assert!(task.max_retries_reached);
        assert_eq!(task.retry_history.len(), 3);
        assert_eq!(task.retry_history[0].feedback, "too short");
        assert_eq!(
            task.retry_history[0].suggestions,
            vec!["expand the analysis".to_string()]
        );
        assert_eq!(
            task.retry_history[0].missing_dimensions,
            vec!["depth".to_string()]
        );

        // Review log was written and holds all three rejections
        let log_path = fx
            .manager
            .inner
            .paths
            .review_logs_dir(1)
            .join(format!("review_{}.md", task_id));
        let log = std::fs::read_to_string(log_path).unwrap();
        assert_eq!(log.matches("REJECTED").count(), 3);
        assert!(log.contains("Total Attempts:** 3"));
    }

    #[tokio::test]
    async fn test_retry_feedback_reaches_next_attempt() {
        let mut task = SubAgentTask::new(1, "d", "base prompt", 10, Utc::now());
        task.add_retry_record(
            "first try",
            "missing pricing".to_string(),
            vec!["include price table".to_string()],
            vec!["cost dimension".to_string()],
            Utc::now(),
        );
        task.retry_count = 1;

        let prompt = build_attempt_prompt(&task);
        assert!(prompt.starts_with("base prompt"));
        assert!(prompt.contains("missing pricing"));
        assert!(prompt.contains("include price table"));
        assert!(prompt.contains("cost dimension"));
    }

    #[tokio::test]
    async fn test_cancel_running_task() {
        let backend = Arc::new(GatedBackend::new(true));
        let fx = fixture(backend, 2, 10);

        let task_id = fx.manager.delegate(1, "long", "never finishes").unwrap();
        wait_for(|| fx.manager.running_count() == 1, "running").await;

        fx.manager.cancel(&task_id).unwrap();
        wait_for(
            || fx.manager.get(&task_id).unwrap().status == TaskStatus::Cancelled,
            "cancelled",
        )
        .await;

        // No files, no result delivered
        let task = fx.manager.get(&task_id).unwrap();
        assert!(task.files_produced.is_empty());
        assert!(task.result.is_none());
    }

    #[tokio::test]
    async fn test_cancel_pending_task() {
        let backend = Arc::new(GatedBackend::new(true));
        let fx = fixture(backend, 1, 10);

        let _running = fx.manager.delegate(1, "holder", "holds the permit").unwrap();
        wait_for(|| fx.manager.running_count() == 1, "holder running").await;
        let pending = fx.manager.delegate(1, "queued", "waits").unwrap();

        fx.manager.cancel(&pending).unwrap();
        wait_for(
            || fx.manager.get(&pending).unwrap().status == TaskStatus::Cancelled,
            "pending cancelled",
        )
        .await;
    }

    #[tokio::test]
    async fn test_task_document_moves_to_completed() {
        let backend = Arc::new(GatedBackend::new(false));
        let fx = fixture(backend, 2, 10);

        let task_id = fx.manager.delegate(1, "docs", "produce docs").unwrap();
        wait_for(
            || fx.manager.get(&task_id).unwrap().status == TaskStatus::Completed,
            "completion",
        )
        .await;

        let running = fx
            .manager
            .inner
            .paths
            .running_tasks_dir(1)
            .join(format!("{}.md", task_id));
        let completed = fx
            .manager
            .inner
            .paths
            .completed_tasks_dir(1)
            .join(format!("{}.md", task_id));
        assert!(!running.exists());
        let doc = std::fs::read_to_string(completed).unwrap();
        assert!(doc.contains("## Result"));
        assert!(doc.contains("done: produce docs"));
    }

    #[tokio::test]
    async fn test_failed_backend_marks_task_failed() {
        struct FailingBackend;

        #[async_trait]
        impl LlmBackend for FailingBackend {
            async fn invoke(
                &self,
                _request: LlmRequest,
            ) -> std::result::Result<LlmReply, LlmError> {
                Err(LlmError::Transport("connection reset".to_string()))
            }

            async fn summarize(&self, _e: &str) -> std::result::Result<String, LlmError> {
                Ok(String::new())
            }
        }

        let fx = fixture(Arc::new(FailingBackend), 2, 10);
        let task_id = fx.manager.delegate(1, "doomed", "will fail").unwrap();

        wait_for(
            || fx.manager.get(&task_id).unwrap().status == TaskStatus::Failed,
            "failure",
        )
        .await;
        let task = fx.manager.get(&task_id).unwrap();
        assert!(task.error.as_deref().unwrap().contains("connection reset"));
    }

    #[tokio::test]
    async fn test_shutdown_refuses_and_cancels() {
        let backend = Arc::new(GatedBackend::new(true));
        let fx = fixture(backend, 1, 10);

        let running = fx.manager.delegate(1, "a", "p").unwrap();
        wait_for(|| fx.manager.running_count() == 1, "running").await;
        let pending = fx.manager.delegate(1, "b", "p").unwrap();

        fx.manager.shutdown();
        assert!(fx.manager.delegate(1, "c", "p").is_err());

        wait_for(
            || {
                fx.manager.get(&running).unwrap().status == TaskStatus::Cancelled
                    && fx.manager.get(&pending).unwrap().status == TaskStatus::Cancelled
            },
            "everything cancelled",
        )
        .await;
    }

    #[tokio::test]
    async fn test_validation_errors_are_synchronous() {
        let fx = fixture(Arc::new(ShortResultBackend), 2, 3);
        assert!(matches!(
            fx.manager.delegate(1, "", "prompt"),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            fx.manager.delegate(1, "desc", "  "),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            fx.manager.cancel("nope1234"),
            Err(Error::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_old_tasks() {
        let backend = Arc::new(GatedBackend::new(false));
        let fx = fixture(backend, 2, 10);

        let task_id = fx.manager.delegate(1, "old", "p").unwrap();
        wait_for(
            || fx.manager.get(&task_id).unwrap().status == TaskStatus::Completed,
            "completion",
        )
        .await;

        assert_eq!(fx.manager.cleanup_old_tasks(3600), 0);
        assert_eq!(fx.manager.cleanup_old_tasks(-1), 1);
        assert!(fx.manager.get(&task_id).is_none());
    }

    #[tokio::test]
    async fn test_artifacts_recorded_and_delivered() {
        struct FileMakingBackend {
            dir: std::path::PathBuf,
        }

        #[async_trait]
        impl LlmBackend for FileMakingBackend {
            async fn invoke(
                &self,
                _request: LlmRequest,
            ) -> std::result::Result<LlmReply, LlmError> {
                std::fs::create_dir_all(self.dir.join("analysis")).unwrap();
                std::fs::write(self.dir.join("analysis/report.md"), b"findings").unwrap();
                std::fs::create_dir_all(self.dir.join("temp")).unwrap();
                std::fs::write(self.dir.join("temp/scratch.txt"), b"scratch").unwrap();
                Ok(LlmReply {
                    text: "wrote a report".to_string(),
                    ..Default::default()
                })
            }

            async fn summarize(&self, _e: &str) -> std::result::Result<String, LlmError> {
                Ok(String::new())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let paths = UserPaths::new(dir.path());
        paths.ensure_user_layout(1).unwrap();

        let backend = Arc::new(FileMakingBackend {
            dir: paths.data_dir(1),
        });
        let adapter = Arc::new(RecordingAdapter::default());
        let bus = Arc::new(EventBus::default());
        let manager = TaskManager::new(
            &HostConfig::default(),
            paths.clone(),
            Arc::new(Outbox::new(adapter.clone())),
            bus,
            backend,
            Arc::new(SystemClock),
        );

        let task_id = manager.delegate(1, "make files", "go").unwrap();
        wait_for(
            || {
                manager
                    .get(&task_id)
                    .map(|t| t.status == TaskStatus::Completed)
                    .unwrap_or(false)
            },
            "completion",
        )
        .await;

        let task = manager.get(&task_id).unwrap();
        assert_eq!(task.files_produced, vec!["analysis/report.md".to_string()]);
        assert!(task.result.as_deref().unwrap().contains("Generated files (1)"));

        // temp/ was cleaned after the diff
        assert!(!paths.data_dir(1).join("temp/scratch.txt").exists());

        wait_for(
            || {
                adapter
                    .sent
                    .lock()
                    .unwrap()
                    .iter()
                    .any(|s| s.contains("analysis/report.md"))
            },
            "file delivery",
        )
        .await;
    }
}
