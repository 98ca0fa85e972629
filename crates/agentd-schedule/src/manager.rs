//! Schedule store and operation log
//!
//! Each user's schedules live in `schedules/tasks.json`; every mutation is
//! atomic against that file and appended to `operation_log.jsonl`. Deletes
//! log a full snapshot so the task can be reconstructed.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::info;

use agentd_core::store::{append_jsonl, load_json, read_jsonl, save_json};
use agentd_core::{Clock, PathLocks, ScheduleCreateSpec, ScheduleSink, UserPaths};

use crate::error::{Result, ScheduleError};
use crate::types::{ScheduleType, ScheduledTask};

/// One entry of the append-only schedule operation log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationLogEntry {
    pub timestamp: DateTime<Utc>,
    /// create, update, delete, enable, disable, execute
    pub action: String,
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonValue>,
    /// Full task snapshot, recorded on delete
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<JsonValue>,
}

/// Partial update of a scheduled task
#[derive(Debug, Clone, Default)]
pub struct ScheduleUpdate {
    pub name: Option<String>,
    pub hour: Option<u32>,
    pub minute: Option<u32>,
    pub prompt: Option<String>,
    pub enabled: Option<bool>,
    pub weekdays: Option<Vec<u8>>,
    pub month_day: Option<u32>,
    pub interval_seconds: Option<u64>,
    /// `Some(None)` clears the limit
    pub max_runs: Option<Option<u32>>,
}

/// Owns all per-user schedule files and their operation logs
pub struct ScheduleManager {
    paths: UserPaths,
    locks: Arc<PathLocks>,
    clock: Arc<dyn Clock>,
}

impl ScheduleManager {
    pub fn new(paths: UserPaths, locks: Arc<PathLocks>, clock: Arc<dyn Clock>) -> Self {
        Self {
            paths,
            locks,
            clock,
        }
    }

    /// Add a new schedule; the task id must be unique for the user
    pub async fn create(&self, user_id: i64, task: ScheduledTask) -> Result<ScheduledTask> {
        task.validate()?;
        let path = self.paths.schedule_tasks_file(user_id);
        let _guard = self.locks.lock(&path).await;

        let mut tasks: HashMap<String, ScheduledTask> = load_json(&path)?.unwrap_or_default();
        if tasks.contains_key(&task.task_id) {
            return Err(ScheduleError::Duplicate(task.task_id.clone()));
        }
        tasks.insert(task.task_id.clone(), task.clone());
        save_json(&path, &tasks)?;

        self.log(
            user_id,
            "create",
            &task.task_id,
            Some(json!({
                "name": task.name,
                "schedule_type": task.schedule_type.as_str(),
                "enabled": task.enabled,
                "max_runs": task.max_runs,
            })),
            None,
        )?;
        info!(user_id, task_id = %task.task_id, "schedule created");
        Ok(task)
    }

    /// Apply a partial update; changed fields are recorded in the log entry
    pub async fn update(
        &self,
        user_id: i64,
        task_id: &str,
        update: ScheduleUpdate,
    ) -> Result<ScheduledTask> {
        let path = self.paths.schedule_tasks_file(user_id);
        let _guard = self.locks.lock(&path).await;

        let mut tasks: HashMap<String, ScheduledTask> = load_json(&path)?.unwrap_or_default();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| ScheduleError::NotFound(task_id.to_string()))?;

        let mut changes = serde_json::Map::new();
        if let Some(name) = update.name {
            changes.insert("name".into(), json!(format!("{} -> {}", task.name, name)));
            task.name = name;
        }
        if update.hour.is_some() || update.minute.is_some() {
            let old = format!("{:02}:{:02}", task.hour, task.minute);
            if let Some(hour) = update.hour {
                task.hour = hour;
            }
            if let Some(minute) = update.minute {
                task.minute = minute;
            }
            let new = format!("{:02}:{:02}", task.hour, task.minute);
            changes.insert("time".into(), json!(format!("{} -> {}", old, new)));
        }
        if let Some(prompt) = update.prompt {
            changes.insert("prompt".into(), json!(format!("updated ({} chars)", prompt.len())));
            task.prompt = prompt;
        }
        if let Some(weekdays) = update.weekdays {
            changes.insert("weekdays".into(), json!(weekdays));
            task.weekdays = Some(weekdays);
        }
        if let Some(month_day) = update.month_day {
            changes.insert("month_day".into(), json!(month_day));
            task.month_day = Some(month_day);
        }
        if let Some(interval) = update.interval_seconds {
            changes.insert("interval_seconds".into(), json!(interval));
            task.interval_seconds = Some(interval);
        }
        if let Some(max_runs) = update.max_runs {
            changes.insert("max_runs".into(), json!(max_runs));
            task.max_runs = max_runs;
        }
        if let Some(enabled) = update.enabled {
            changes.insert("enabled".into(), json!(enabled));
            task.enabled = enabled;
        }

        task.validate()?;
        let updated = task.clone();
        save_json(&path, &tasks)?;

        if !changes.is_empty() {
            self.log(
                user_id,
                "update",
                task_id,
                Some(JsonValue::Object(changes)),
                None,
            )?;
        }
        Ok(updated)
    }

    /// Remove a schedule, logging a full snapshot for recovery
    pub async fn delete(&self, user_id: i64, task_id: &str) -> Result<()> {
        let path = self.paths.schedule_tasks_file(user_id);
        let _guard = self.locks.lock(&path).await;

        let mut tasks: HashMap<String, ScheduledTask> = load_json(&path)?.unwrap_or_default();
        let task = tasks
            .remove(task_id)
            .ok_or_else(|| ScheduleError::NotFound(task_id.to_string()))?;
        save_json(&path, &tasks)?;

        self.log(
            user_id,
            "delete",
            task_id,
            None,
            Some(serde_json::to_value(&task)?),
        )?;
        info!(user_id, task_id, "schedule deleted");
        Ok(())
    }

    pub async fn enable(&self, user_id: i64, task_id: &str) -> Result<()> {
        self.set_enabled(user_id, task_id, true).await
    }

    pub async fn disable(&self, user_id: i64, task_id: &str) -> Result<()> {
        self.set_enabled(user_id, task_id, false).await
    }

    /// Clear run_count and re-enable a task that hit its max_runs
    pub async fn reset(&self, user_id: i64, task_id: &str) -> Result<ScheduledTask> {
        let path = self.paths.schedule_tasks_file(user_id);
        let _guard = self.locks.lock(&path).await;

        let mut tasks: HashMap<String, ScheduledTask> = load_json(&path)?.unwrap_or_default();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| ScheduleError::NotFound(task_id.to_string()))?;
        let old_count = task.run_count;
        task.run_count = 0;
        task.last_run = None;
        task.enabled = true;
        let reset = task.clone();
        save_json(&path, &tasks)?;

        self.log(
            user_id,
            "update",
            task_id,
            Some(json!({"run_count": format!("{} -> 0", old_count), "enabled": true})),
            None,
        )?;
        Ok(reset)
    }

    pub async fn get(&self, user_id: i64, task_id: &str) -> Result<ScheduledTask> {
        self.load(user_id)
            .await?
            .remove(task_id)
            .ok_or_else(|| ScheduleError::NotFound(task_id.to_string()))
    }

    /// All schedules for a user, ordered by task id
    pub async fn list(&self, user_id: i64) -> Result<Vec<ScheduledTask>> {
        let mut tasks: Vec<ScheduledTask> = self.load(user_id).await?.into_values().collect();
        tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(tasks)
    }

    /// Record a fire: bump run_count, set last_run, auto-disable once
    /// max_runs is reached or the task was one-shot
    pub async fn mark_fired(&self, user_id: i64, task_id: &str) -> Result<ScheduledTask> {
        let path = self.paths.schedule_tasks_file(user_id);
        let _guard = self.locks.lock(&path).await;

        let mut tasks: HashMap<String, ScheduledTask> = load_json(&path)?.unwrap_or_default();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| ScheduleError::NotFound(task_id.to_string()))?;

        task.run_count += 1;
        task.last_run = Some(self.clock.now_utc());
        if task.runs_exhausted() || task.schedule_type == ScheduleType::Once {
            task.enabled = false;
        }
        let fired = task.clone();
        save_json(&path, &tasks)?;
        Ok(fired)
    }

    /// Append an execute entry linking the fire to its sub-agent task
    pub fn log_execution(
        &self,
        user_id: i64,
        task_id: &str,
        sub_agent_task_id: &str,
        run_count: u32,
    ) -> Result<()> {
        self.log(
            user_id,
            "execute",
            task_id,
            Some(json!({
                "sub_agent_task_id": sub_agent_task_id,
                "run_count": run_count,
            })),
            None,
        )
    }

    /// Recent operation log entries, newest first
    pub fn operation_log(&self, user_id: i64, limit: usize) -> Result<Vec<OperationLogEntry>> {
        let mut entries: Vec<OperationLogEntry> =
            read_jsonl(self.paths.operation_log_file(user_id))?;
        entries.reverse();
        entries.truncate(limit);
        Ok(entries)
    }

    async fn set_enabled(&self, user_id: i64, task_id: &str, enabled: bool) -> Result<()> {
        let path = self.paths.schedule_tasks_file(user_id);
        let _guard = self.locks.lock(&path).await;

        let mut tasks: HashMap<String, ScheduledTask> = load_json(&path)?.unwrap_or_default();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| ScheduleError::NotFound(task_id.to_string()))?;
        task.enabled = enabled;
        save_json(&path, &tasks)?;

        self.log(
            user_id,
            if enabled { "enable" } else { "disable" },
            task_id,
            None,
            None,
        )?;
        Ok(())
    }

    async fn load(&self, user_id: i64) -> Result<HashMap<String, ScheduledTask>> {
        let path = self.paths.schedule_tasks_file(user_id);
        let _guard = self.locks.lock(&path).await;
        Ok(load_json(&path)?.unwrap_or_default())
    }

    fn log(
        &self,
        user_id: i64,
        action: &str,
        task_id: &str,
        details: Option<JsonValue>,
        snapshot: Option<JsonValue>,
    ) -> Result<()> {
        let entry = OperationLogEntry {
            timestamp: self.clock.now_utc(),
            action: action.to_string(),
            task_id: task_id.to_string(),
            details,
            snapshot,
        };
        append_jsonl(self.paths.operation_log_file(user_id), &entry)?;
        Ok(())
    }
}

/// Receives `schedule_create` tool intents from the host
#[async_trait]
impl ScheduleSink for ScheduleManager {
    async fn create_schedule(
        &self,
        user_id: i64,
        spec: ScheduleCreateSpec,
    ) -> agentd_core::Result<()> {
        let task = task_from_spec(&spec, self.clock.now_utc())?;
        self.create(user_id, task).await.map_err(into_core)?;
        Ok(())
    }
}

fn task_from_spec(
    spec: &ScheduleCreateSpec,
    now: DateTime<Utc>,
) -> agentd_core::Result<ScheduledTask> {
    let schedule_type = match spec.schedule_type.as_str() {
        "daily" => ScheduleType::Daily,
        "weekly" => ScheduleType::Weekly,
        "monthly" => ScheduleType::Monthly,
        "interval" => ScheduleType::Interval,
        "once" => ScheduleType::Once,
        other => {
            return Err(agentd_core::Error::Validation(format!(
                "unknown schedule_type: {}",
                other
            )))
        }
    };

    let mut task = ScheduledTask::new(
        spec.task_id.as_str(),
        spec.name.as_str(),
        schedule_type,
        spec.prompt.as_str(),
        now,
    )
    .at(spec.hour, spec.minute);

    if let Some(weekdays) = &spec.weekdays {
        task = task.on_weekdays(weekdays.clone());
    }
    if let Some(day) = spec.month_day {
        task = task.on_month_day(day);
    }
    if let Some(seconds) = spec.interval_seconds {
        task = task.every_seconds(seconds);
    }
    if let Some(run_date) = &spec.run_date {
        let date = NaiveDate::parse_from_str(run_date, "%Y-%m-%d").map_err(|_| {
            agentd_core::Error::Validation(format!("run_date must be YYYY-MM-DD: {}", run_date))
        })?;
        task = task.on_date(date);
    }
    if let Some(max_runs) = spec.max_runs {
        task = task.with_max_runs(max_runs);
    }
    Ok(task)
}

fn into_core(error: ScheduleError) -> agentd_core::Error {
    match error {
        ScheduleError::Core(core) => core,
        other => agentd_core::Error::Validation(other.to_string()),
    }
}
