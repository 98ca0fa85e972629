//! Agent host wiring
//!
//! [`AgentHost`] is the single owning value constructed at startup. It wires
//! the managers together and drives the message flow: session resolution,
//! context recovery, the backend call with remote-session retry, and
//! dispatch of the tool intents the model returns.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::adapter::{ChatAdapter, Outbox};
use crate::clock::Clock;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::llm::{LlmBackend, LlmError, LlmRequest, ToolCallIntent};
use crate::memory::{MemoryCategory, MemoryStore, NewMemory, SearchQuery};
use crate::session::{ChatRole, ExpiryReason, SessionManager};
use crate::store::{DiskQuotaGate, PathLocks, QuotaGate, UserPaths};
use crate::tasks::TaskManager;
use crate::users::UserRegistry;

/// Arguments of a `schedule_create` tool call. Field-level checks happen
/// at parse time; the scheduler applies its full validation on create.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleCreateSpec {
    pub task_id: String,
    pub name: String,
    /// daily, weekly, monthly, interval, or once
    pub schedule_type: String,
    pub hour: u32,
    pub minute: u32,
    pub weekdays: Option<Vec<u8>>,
    pub month_day: Option<u32>,
    pub interval_seconds: Option<u64>,
    /// YYYY-MM-DD, for once schedules
    pub run_date: Option<String>,
    pub max_runs: Option<u32>,
    pub prompt: String,
}

/// Seam through which `schedule_create` intents reach the scheduler; the
/// scheduler crate implements this and the binary wires it in
#[async_trait]
pub trait ScheduleSink: Send + Sync {
    async fn create_schedule(&self, user_id: i64, spec: ScheduleCreateSpec) -> Result<()>;
}

/// Validated tool call, one variant per dispatchable operation
#[derive(Debug, Clone, PartialEq)]
pub enum ToolIntent {
    SendMessage {
        text: String,
    },
    SendFile {
        path: String,
        caption: Option<String>,
    },
    DelegateTask {
        description: String,
        prompt: String,
    },
    DelegateReviewTask {
        description: String,
        prompt: String,
        review_criteria: String,
    },
    ScheduleCreate {
        spec: ScheduleCreateSpec,
    },
    SaveMemory {
        content: String,
        category: MemoryCategory,
        tags: Vec<String>,
    },
}

impl ToolIntent {
    /// Validate a raw tool call into a typed intent
    pub fn parse(call: &ToolCallIntent) -> Result<Self> {
        let args = &call.arguments;
        match call.name.as_str() {
            "send_message" => Ok(ToolIntent::SendMessage {
                text: required_str(args, "text")?,
            }),
            "send_file" => Ok(ToolIntent::SendFile {
                path: required_str(args, "path")?,
                caption: optional_str(args, "caption"),
            }),
            "delegate_task" => Ok(ToolIntent::DelegateTask {
                description: required_str(args, "description")?,
                prompt: required_str(args, "prompt")?,
            }),
            "delegate_review_task" => Ok(ToolIntent::DelegateReviewTask {
                description: required_str(args, "description")?,
                prompt: required_str(args, "prompt")?,
                review_criteria: required_str(args, "review_criteria")?,
            }),
            "schedule_create" => {
                let schedule_type = required_str(args, "schedule_type")?;
                if !matches!(
                    schedule_type.as_str(),
                    "daily" | "weekly" | "monthly" | "interval" | "once"
                ) {
                    return Err(Error::Validation(format!(
                        "unknown schedule_type: {}",
                        schedule_type
                    )));
                }

                let hour = optional_u32(args, "hour")?.unwrap_or(0);
                let minute = optional_u32(args, "minute")?.unwrap_or(0);
                if schedule_type != "interval" && (hour > 23 || minute > 59) {
                    return Err(Error::Validation(format!(
                        "invalid time {:02}:{:02}",
                        hour, minute
                    )));
                }

                let run_date = optional_str(args, "run_date");
                if let Some(run_date) = &run_date {
                    chrono::NaiveDate::parse_from_str(run_date, "%Y-%m-%d").map_err(|_| {
                        Error::Validation(format!("run_date must be YYYY-MM-DD: {}", run_date))
                    })?;
                }

                let weekdays = match args.get("weekdays").filter(|v| !v.is_null()) {
                    None => None,
                    Some(value) => {
                        let items = value.as_array().ok_or_else(|| {
                            Error::Validation("weekdays must be an array".to_string())
                        })?;
                        let mut days = Vec::new();
                        for item in items {
                            let day = item.as_u64().filter(|d| *d <= 6).ok_or_else(|| {
                                Error::Validation(
                                    "weekdays must be 0..=6 (Monday..Sunday)".to_string(),
                                )
                            })?;
                            days.push(day as u8);
                        }
                        Some(days)
                    }
                };

                Ok(ToolIntent::ScheduleCreate {
                    spec: ScheduleCreateSpec {
                        task_id: required_str(args, "task_id")?,
                        name: required_str(args, "name")?,
                        schedule_type,
                        hour,
                        minute,
                        weekdays,
                        month_day: optional_u32(args, "month_day")?,
                        interval_seconds: optional_u64(args, "interval_seconds")?,
                        run_date,
                        max_runs: optional_u32(args, "max_runs")?,
                        prompt: required_str(args, "prompt")?,
                    },
                })
            }
            "save_memory" => {
                let category_raw = required_str(args, "category")?;
                let category: MemoryCategory =
                    serde_json::from_value(JsonValue::String(category_raw.clone())).map_err(
                        |_| Error::Validation(format!("unknown memory category: {}", category_raw)),
                    )?;
                let tags = args
                    .get("tags")
                    .and_then(|v| v.as_array())
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(ToolIntent::SaveMemory {
                    content: required_str(args, "content")?,
                    category,
                    tags,
                })
            }
            other => Err(Error::Validation(format!("unknown tool: {}", other))),
        }
    }
}

fn required_str(args: &JsonValue, key: &str) -> Result<String> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::Validation(format!("missing or empty argument: {}", key)))
}

fn optional_str(args: &JsonValue, key: &str) -> Option<String> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn optional_u64(args: &JsonValue, key: &str) -> Result<Option<u64>> {
    match args.get(key) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(value) => value.as_u64().map(Some).ok_or_else(|| {
            Error::Validation(format!("argument {} must be a non-negative integer", key))
        }),
    }
}

fn optional_u32(args: &JsonValue, key: &str) -> Result<Option<u32>> {
    match optional_u64(args, key)? {
        None => Ok(None),
        Some(value) => u32::try_from(value).map(Some).map_err(|_| {
            Error::Validation(format!("argument {} is out of range", key))
        }),
    }
}

/// Everything the host owns, constructed once at startup
pub struct AgentHost {
    paths: UserPaths,
    locks: Arc<PathLocks>,
    backend: Arc<dyn LlmBackend>,
    /// Set once by the binary wiring; schedule_create intents fail
    /// validation until then
    schedules: std::sync::OnceLock<Arc<dyn ScheduleSink>>,
    pub users: Arc<UserRegistry>,
    pub sessions: Arc<SessionManager>,
    pub memories: Arc<MemoryStore>,
    pub tasks: Arc<TaskManager>,
    pub events: Arc<EventBus>,
    pub quota: Arc<DiskQuotaGate>,
    pub outbox: Arc<Outbox>,
}

impl AgentHost {
    pub fn new(
        config: &Config,
        backend: Arc<dyn LlmBackend>,
        adapter: Arc<dyn ChatAdapter>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let paths = UserPaths::new(&config.host.data_root);
        let locks = Arc::new(PathLocks::new());
        let outbox = Arc::new(Outbox::new(adapter));
        let events = Arc::new(EventBus::new(std::time::Duration::from_secs(
            config.host.ping_interval_seconds.max(1),
        )));
        let quota = Arc::new(DiskQuotaGate::new(
            paths.clone(),
            config.host.default_quota_bytes,
        ));
        let users = Arc::new(UserRegistry::new(
            paths.clone(),
            locks.clone(),
            config.host.default_quota_bytes,
        )?);
        let sessions = Arc::new(SessionManager::new(
            &config.host,
            paths.clone(),
            locks.clone(),
            clock.clone(),
            backend.clone(),
        )?);
        let memories = Arc::new(MemoryStore::new(paths.clone(), locks.clone()));
        let tasks = Arc::new(TaskManager::new(
            &config.host,
            paths.clone(),
            outbox.clone(),
            events.clone(),
            backend.clone(),
            clock,
        ));

        Ok(Self {
            paths,
            locks,
            backend,
            schedules: std::sync::OnceLock::new(),
            users,
            sessions,
            memories,
            tasks,
            events,
            quota,
            outbox,
        })
    }

    /// Wire in the scheduler that receives schedule_create intents
    pub fn set_schedule_sink(&self, sink: Arc<dyn ScheduleSink>) {
        let _ = self.schedules.set(sink);
    }

    /// Per-user path layout shared with sibling services
    pub fn paths(&self) -> &UserPaths {
        &self.paths
    }

    /// Per-file lock table shared with sibling services
    pub fn locks(&self) -> Arc<PathLocks> {
        self.locks.clone()
    }

    /// Handle one inbound user message end to end; returns the reply text
    pub async fn handle_message(
        &self,
        user_id: i64,
        display_name: &str,
        text: &str,
    ) -> Result<String> {
        let user = self.users.get_or_create(user_id, display_name).await?;
        if !user.enabled {
            return Err(Error::UserDisabled(user_id));
        }
        self.quota.set_quota(user_id, user.quota_bytes);

        let session = self.sessions.open_or_resume(user_id).await?;

        // Re-seed the backend when the conversation went quiet
        let mut context = if self.sessions.is_stale(user_id).await {
            Some(self.sessions.recover_context(user_id).await)
        } else {
            None
        };
        if let Some(memories) = self.recalled_memories(user_id).await {
            context = Some(match context {
                Some(block) => format!("{}\n\n{}", memories, block),
                None => memories,
            });
        }

        let mut request = LlmRequest::new(text).with_remote_id(session.remote_id.clone());
        if let Some(context) = context.filter(|c| !c.trim().is_empty()) {
            request = request.with_context(context);
        }

        let reply = match self.backend.invoke(request).await {
            Ok(reply) => reply,
            Err(LlmError::RemoteUnknown) => {
                // The backend forgot us: archive, reopen, retry once with
                // rebuilt context
                info!(user_id, "remote session unknown, recovering");
                self.sessions
                    .expire(user_id, ExpiryReason::RemoteUnknown)
                    .await?;
                self.sessions.open_or_resume(user_id).await?;
                let context = self.sessions.recover_context(user_id).await;
                let retry = LlmRequest::new(text).with_context(context);
                self.backend.invoke(retry).await?
            }
            Err(e) => return Err(e.into()),
        };

        self.sessions
            .set_remote_id(user_id, reply.remote_id.clone())
            .await?;
        self.sessions
            .record_turn(user_id, ChatRole::User, text, None)
            .await?;
        self.sessions
            .record_turn(user_id, ChatRole::Assistant, &reply.text, Some(reply.usage))
            .await?;

        for call in &reply.tool_calls {
            match ToolIntent::parse(call) {
                Ok(intent) => {
                    if let Err(e) = self.dispatch(user_id, intent).await {
                        warn!(user_id, tool = %call.name, "tool dispatch failed: {}", e);
                    }
                }
                Err(e) => warn!(user_id, tool = %call.name, "invalid tool call: {}", e),
            }
        }

        Ok(reply.text)
    }

    /// Execute one validated tool intent
    pub async fn dispatch(&self, user_id: i64, intent: ToolIntent) -> Result<()> {
        match intent {
            ToolIntent::SendMessage { text } => {
                self.outbox.send_text(user_id, &text).await;
                Ok(())
            }
            ToolIntent::SendFile { path, caption } => {
                let resolved = self.resolve_user_path(user_id, &path)?;
                self.outbox.send_file(user_id, resolved, caption).await;
                Ok(())
            }
            ToolIntent::DelegateTask {
                description,
                prompt,
            } => {
                self.tasks.delegate(user_id, description, prompt)?;
                Ok(())
            }
            ToolIntent::DelegateReviewTask {
                description,
                prompt,
                review_criteria,
            } => {
                self.tasks
                    .delegate_and_review(user_id, description, prompt, review_criteria)?;
                Ok(())
            }
            ToolIntent::ScheduleCreate { spec } => {
                let sink = self.schedules.get().cloned().ok_or_else(|| {
                    Error::Validation("scheduler is not available".to_string())
                })?;
                sink.create_schedule(user_id, spec).await
            }
            ToolIntent::SaveMemory {
                content,
                category,
                tags,
            } => {
                self.memories
                    .save(user_id, NewMemory::new(content, category).with_tags(tags))
                    .await?;
                Ok(())
            }
        }
    }

    /// Gate for writes that enlarge the user's working directory. Transports
    /// call this before accepting an upload; denial is a soft failure for
    /// the caller to report.
    pub async fn admit_write(&self, user_id: i64, additional_bytes: u64) -> Result<()> {
        match self.quota.check(user_id, additional_bytes).await? {
            crate::store::QuotaDecision::Ok => Ok(()),
            crate::store::QuotaDecision::Denied { reason } => Err(Error::QuotaDenied(reason)),
        }
    }

    /// Publish the user's storage usage to dashboard subscribers
    pub async fn publish_storage_update(&self, user_id: i64) -> Result<()> {
        let report = self.quota.report(user_id).await?;
        self.events
            .broadcast_storage_update(user_id, report.used_bytes, report.quota_bytes);
        Ok(())
    }

    /// Refuse new work, cancel running tasks, and flush durable state
    pub fn shutdown(&self) {
        info!("agent host shutting down");
        self.tasks.shutdown();
    }

    /// Resolve a user-supplied path against the working directory,
    /// rejecting anything that escapes it
    fn resolve_user_path(&self, user_id: i64, path: &str) -> Result<PathBuf> {
        let data_dir = self
            .paths
            .data_dir(user_id)
            .canonicalize()
            .map_err(|_| Error::PathEscape(PathBuf::from(path)))?;
        let candidate = if std::path::Path::new(path).is_absolute() {
            PathBuf::from(path)
        } else {
            data_dir.join(path)
        };
        let resolved = candidate
            .canonicalize()
            .map_err(|_| Error::PathEscape(candidate.clone()))?;
        if !resolved.starts_with(&data_dir) {
            return Err(Error::PathEscape(resolved));
        }
        Ok(resolved)
    }

    async fn recalled_memories(&self, user_id: i64) -> Option<String> {
        let memories = self
            .memories
            .search(
                user_id,
                SearchQuery {
                    limit: 10,
                    ..Default::default()
                },
            )
            .await
            .ok()?;
        if memories.is_empty() {
            return None;
        }
        let mut block = String::from("## Known facts about the user\n");
        for memory in memories {
            block.push_str(&format!(
                "- [{}] {}\n",
                memory.category.as_str(),
                memory.content
            ));
        }
        Some(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::tests::RecordingAdapter;
    use crate::clock::ManualClock;
    use crate::llm::{LlmReply, Usage};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Mutex;

    /// Backend that records requests and fails with RemoteUnknown once
    /// when asked to resume
    struct FlakyRemoteBackend {
        requests: Mutex<Vec<LlmRequest>>,
        fail_remote_once: Mutex<bool>,
    }

    impl FlakyRemoteBackend {
        fn new(fail_remote_once: bool) -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                fail_remote_once: Mutex::new(fail_remote_once),
            }
        }
    }

    #[async_trait]
    impl LlmBackend for FlakyRemoteBackend {
        async fn invoke(&self, request: LlmRequest) -> std::result::Result<LlmReply, LlmError> {
            let has_remote = request.remote_id.is_some();
            self.requests.lock().unwrap().push(request);
            if has_remote {
                let mut fail = self.fail_remote_once.lock().unwrap();
                if *fail {
                    *fail = false;
                    return Err(LlmError::RemoteUnknown);
                }
            }
            Ok(LlmReply {
                text: "reply".to_string(),
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 5,
                    cost_usd: 0.001,
                },
                remote_id: Some("remote-1".to_string()),
                ..Default::default()
            })
        }

        async fn summarize(&self, _e: &str) -> std::result::Result<String, LlmError> {
            Ok("archived summary".to_string())
        }
    }

    struct Fixture {
        host: AgentHost,
        backend: Arc<FlakyRemoteBackend>,
        clock: ManualClock,
        _dir: tempfile::TempDir,
    }

    fn fixture(fail_remote_once: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_data_root(dir.path());
        let backend = Arc::new(FlakyRemoteBackend::new(fail_remote_once));
        let clock = ManualClock::new(Utc::now());
        let host = AgentHost::new(
            &config,
            backend.clone(),
            Arc::new(RecordingAdapter::default()),
            Arc::new(clock.clone()),
        )
        .unwrap();
        Fixture {
            host,
            backend,
            clock,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_handle_message_happy_path() {
        let fx = fixture(false);
        let reply = fx.host.handle_message(1, "alice", "hello").await.unwrap();
        assert_eq!(reply, "reply");

        let session = fx.host.sessions.get(1).await.unwrap();
        assert_eq!(session.message_count, 2);
        assert_eq!(session.remote_id.as_deref(), Some("remote-1"));
        assert_eq!(session.input_tokens, 10);
    }

    #[tokio::test]
    async fn test_stale_session_attaches_recovered_context() {
        let fx = fixture(false);
        fx.host
            .handle_message(1, "alice", "remember the report")
            .await
            .unwrap();

        // 11 minutes of silence: stale but not expired
        fx.clock.advance(chrono::Duration::minutes(11));
        fx.host.handle_message(1, "alice", "continue").await.unwrap();

        let requests = fx.backend.requests.lock().unwrap();
        let last = requests.last().unwrap();
        let context = last.context.as_deref().unwrap();
        assert!(context.contains("remember the report"));
    }

    #[tokio::test]
    async fn test_remote_unknown_triggers_recovery_and_retry() {
        let fx = fixture(true);

        // First message establishes the remote id
        fx.host.handle_message(1, "alice", "first").await.unwrap();
        let old_session = fx.host.sessions.get(1).await.unwrap();

        // Second message hits RemoteUnknown, recovers, retries
        let reply = fx.host.handle_message(1, "alice", "second").await.unwrap();
        assert_eq!(reply, "reply");

        let new_session = fx.host.sessions.get(1).await.unwrap();
        assert_ne!(old_session.id, new_session.id);

        // The retry carried rebuilt context from the archived summary
        let requests = fx.backend.requests.lock().unwrap();
        let retry = requests.last().unwrap();
        assert!(retry.remote_id.is_none());
        assert!(retry
            .context
            .as_deref()
            .unwrap()
            .contains("archived summary"));
    }

    #[tokio::test]
    async fn test_disabled_user_rejected() {
        let fx = fixture(false);
        fx.host.users.get_or_create(1, "alice").await.unwrap();
        fx.host.users.set_enabled(1, false).await.unwrap();

        let err = fx.host.handle_message(1, "alice", "hi").await.unwrap_err();
        assert!(matches!(err, Error::UserDisabled(1)));
    }

    #[tokio::test]
    async fn test_memories_recalled_into_context() {
        let fx = fixture(false);
        fx.host.users.get_or_create(1, "alice").await.unwrap();
        fx.host
            .memories
            .save(1, NewMemory::new("prefers short answers", MemoryCategory::Preferences))
            .await
            .unwrap();

        fx.host.handle_message(1, "alice", "hello").await.unwrap();

        let requests = fx.backend.requests.lock().unwrap();
        let context = requests[0].context.as_deref().unwrap();
        assert!(context.contains("prefers short answers"));
    }

    #[test]
    fn test_tool_intent_parse_and_validation() {
        let call = ToolCallIntent {
            name: "delegate_task".to_string(),
            arguments: json!({"description": "research", "prompt": "go deep"}),
        };
        assert_eq!(
            ToolIntent::parse(&call).unwrap(),
            ToolIntent::DelegateTask {
                description: "research".to_string(),
                prompt: "go deep".to_string()
            }
        );

        let missing = ToolCallIntent {
            name: "delegate_task".to_string(),
            arguments: json!({"description": "research"}),
        };
        assert!(matches!(
            ToolIntent::parse(&missing),
            Err(Error::Validation(_))
        ));

        let unknown = ToolCallIntent {
            name: "format_disk".to_string(),
            arguments: json!({}),
        };
        assert!(matches!(
            ToolIntent::parse(&unknown),
            Err(Error::Validation(_))
        ));

        let bad_category = ToolCallIntent {
            name: "save_memory".to_string(),
            arguments: json!({"content": "x", "category": "astrology"}),
        };
        assert!(matches!(
            ToolIntent::parse(&bad_category),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_schedule_create_parse() {
        let call = ToolCallIntent {
            name: "schedule_create".to_string(),
            arguments: json!({
                "task_id": "brief",
                "name": "Morning brief",
                "schedule_type": "weekly",
                "hour": 9,
                "minute": 30,
                "weekdays": [0, 2, 4],
                "max_runs": 10,
                "prompt": "summarize the news"
            }),
        };
        match ToolIntent::parse(&call).unwrap() {
            ToolIntent::ScheduleCreate { spec } => {
                assert_eq!(spec.task_id, "brief");
                assert_eq!(spec.schedule_type, "weekly");
                assert_eq!((spec.hour, spec.minute), (9, 30));
                assert_eq!(spec.weekdays, Some(vec![0, 2, 4]));
                assert_eq!(spec.max_runs, Some(10));
                assert!(spec.run_date.is_none());
            }
            other => panic!("unexpected intent: {:?}", other),
        }
    }

    #[test]
    fn test_schedule_create_parse_rejects_bad_arguments() {
        let cases = [
            json!({"task_id": "t", "name": "n", "schedule_type": "hourly", "prompt": "p"}),
            json!({"task_id": "t", "name": "n", "schedule_type": "daily", "hour": 24, "prompt": "p"}),
            json!({"task_id": "t", "name": "n", "schedule_type": "once", "run_date": "tomorrow", "prompt": "p"}),
            json!({"task_id": "t", "name": "n", "schedule_type": "weekly", "weekdays": [7], "prompt": "p"}),
            json!({"task_id": "t", "name": "n", "schedule_type": "daily"}),
        ];
        for arguments in cases {
            let call = ToolCallIntent {
                name: "schedule_create".to_string(),
                arguments: arguments.clone(),
            };
            assert!(
                matches!(ToolIntent::parse(&call), Err(Error::Validation(_))),
                "expected rejection for {}",
                arguments
            );
        }
    }

    #[tokio::test]
    async fn test_schedule_create_dispatch_reaches_sink() {
        struct RecordingSink {
            created: Mutex<Vec<(i64, ScheduleCreateSpec)>>,
        }

        #[async_trait]
        impl ScheduleSink for RecordingSink {
            async fn create_schedule(&self, user_id: i64, spec: ScheduleCreateSpec) -> Result<()> {
                self.created.lock().unwrap().push((user_id, spec));
                Ok(())
            }
        }

        let fx = fixture(false);
        fx.host.users.get_or_create(1, "alice").await.unwrap();
        let spec = ScheduleCreateSpec {
            task_id: "brief".to_string(),
            name: "Brief".to_string(),
            schedule_type: "daily".to_string(),
            hour: 9,
            minute: 0,
            weekdays: None,
            month_day: None,
            interval_seconds: None,
            run_date: None,
            max_runs: None,
            prompt: "news".to_string(),
        };

        // Before wiring, the intent is a synchronous validation failure
        let err = fx
            .host
            .dispatch(1, ToolIntent::ScheduleCreate { spec: spec.clone() })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let sink = Arc::new(RecordingSink {
            created: Mutex::new(Vec::new()),
        });
        fx.host.set_schedule_sink(sink.clone());
        fx.host
            .dispatch(1, ToolIntent::ScheduleCreate { spec: spec.clone() })
            .await
            .unwrap();

        let created = sink.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].0, 1);
        assert_eq!(created[0].1, spec);
    }

    #[tokio::test]
    async fn test_send_file_path_escape_rejected() {
        let fx = fixture(false);
        fx.host.users.get_or_create(1, "alice").await.unwrap();

        let err = fx
            .host
            .dispatch(
                1,
                ToolIntent::SendFile {
                    path: "../../users.json".to_string(),
                    caption: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PathEscape(_)));
    }

    #[tokio::test]
    async fn test_admit_write_quota_denied() {
        let fx = fixture(false);
        fx.host.users.get_or_create(1, "alice").await.unwrap();

        assert!(fx.host.admit_write(1, 64).await.is_ok());

        fx.host.quota.set_quota(1, 16);
        let err = fx.host.admit_write(1, 1024).await.unwrap_err();
        assert!(matches!(err, Error::QuotaDenied(_)));
    }

    #[tokio::test]
    async fn test_storage_update_published() {
        let fx = fixture(false);
        fx.host.users.get_or_create(1, "alice").await.unwrap();
        let (_id, mut rx) = fx.host.events.subscribe(1);

        fx.host.publish_storage_update(1).await.unwrap();
        match rx.recv().await {
            Some(crate::events::Event::StorageUpdate { quota_bytes, .. }) => {
                assert!(quota_bytes > 0)
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
