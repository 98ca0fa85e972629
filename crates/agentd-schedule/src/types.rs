//! Scheduled task types and validation

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ScheduleError};

/// Recurrence rule kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Daily,
    Weekly,
    Monthly,
    Interval,
    Once,
}

impl ScheduleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleType::Daily => "daily",
            ScheduleType::Weekly => "weekly",
            ScheduleType::Monthly => "monthly",
            ScheduleType::Interval => "interval",
            ScheduleType::Once => "once",
        }
    }
}

/// A user-defined scheduled task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    /// Unique per user, `[A-Za-z0-9_]{1,32}`
    pub task_id: String,
    pub name: String,
    pub schedule_type: ScheduleType,
    /// Local wall-clock hour, ignored for interval
    pub hour: u32,
    /// Local wall-clock minute, ignored for interval
    pub minute: u32,
    /// Weekly only: days of week, 0 = Monday .. 6 = Sunday
    pub weekdays: Option<Vec<u8>>,
    /// Monthly only: day of month 1..=31; months without it are skipped
    pub month_day: Option<u32>,
    /// Interval only: seconds between fires
    pub interval_seconds: Option<u64>,
    /// Once only: the date to fire on
    pub run_date: Option<NaiveDate>,
    /// Interval only: earliest fire time; past or unset fires immediately
    pub first_fire_at: Option<DateTime<Utc>>,
    pub enabled: bool,
    /// Fire at most this many times; reaching it disables the task
    pub max_runs: Option<u32>,
    pub run_count: u32,
    pub last_run: Option<DateTime<Utc>>,
    /// Instructions submitted to the sub-agent on each fire
    pub prompt: String,
    pub created_at: DateTime<Utc>,
}

impl ScheduledTask {
    pub fn new(
        task_id: impl Into<String>,
        name: impl Into<String>,
        schedule_type: ScheduleType,
        prompt: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            name: name.into(),
            schedule_type,
            hour: 0,
            minute: 0,
            weekdays: None,
            month_day: None,
            interval_seconds: None,
            run_date: None,
            first_fire_at: None,
            enabled: true,
            max_runs: None,
            run_count: 0,
            last_run: None,
            prompt: prompt.into(),
            created_at: now,
        }
    }

    pub fn at(mut self, hour: u32, minute: u32) -> Self {
        self.hour = hour;
        self.minute = minute;
        self
    }

    pub fn on_weekdays(mut self, weekdays: Vec<u8>) -> Self {
        self.weekdays = Some(weekdays);
        self
    }

    pub fn on_month_day(mut self, day: u32) -> Self {
        self.month_day = Some(day);
        self
    }

    pub fn every_seconds(mut self, seconds: u64) -> Self {
        self.interval_seconds = Some(seconds);
        self
    }

    pub fn on_date(mut self, date: NaiveDate) -> Self {
        self.run_date = Some(date);
        self
    }

    pub fn starting_at(mut self, at: DateTime<Utc>) -> Self {
        self.first_fire_at = Some(at);
        self
    }

    pub fn with_max_runs(mut self, max_runs: u32) -> Self {
        self.max_runs = Some(max_runs);
        self
    }

    /// Fires are exhausted once run_count reaches max_runs
    pub fn runs_exhausted(&self) -> bool {
        self.max_runs
            .map(|max| self.run_count >= max)
            .unwrap_or(false)
    }

    /// Validate identifier, time ranges, and type-specific fields
    pub fn validate(&self) -> Result<()> {
        if !valid_task_id(&self.task_id) {
            return Err(ScheduleError::InvalidTaskId(self.task_id.clone()));
        }
        if self.name.trim().is_empty() {
            return Err(ScheduleError::InvalidSpec("name is empty".to_string()));
        }
        if self.prompt.trim().is_empty() {
            return Err(ScheduleError::InvalidSpec("prompt is empty".to_string()));
        }
        if self.schedule_type != ScheduleType::Interval
            && (self.hour > 23 || self.minute > 59)
        {
            return Err(ScheduleError::InvalidTime {
                hour: self.hour,
                minute: self.minute,
            });
        }

        match self.schedule_type {
            ScheduleType::Weekly => {
                let weekdays = self
                    .weekdays
                    .as_ref()
                    .filter(|w| !w.is_empty())
                    .ok_or_else(|| {
                        ScheduleError::InvalidSpec("weekly schedule needs weekdays".to_string())
                    })?;
                if weekdays.iter().any(|d| *d > 6) {
                    return Err(ScheduleError::InvalidSpec(
                        "weekdays must be 0..=6 (Monday..Sunday)".to_string(),
                    ));
                }
            }
            ScheduleType::Monthly => {
                let day = self.month_day.ok_or_else(|| {
                    ScheduleError::InvalidSpec("monthly schedule needs month_day".to_string())
                })?;
                if !(1..=31).contains(&day) {
                    return Err(ScheduleError::InvalidSpec(
                        "month_day must be 1..=31".to_string(),
                    ));
                }
            }
            ScheduleType::Interval => {
                if self.interval_seconds.map(|s| s == 0).unwrap_or(true) {
                    return Err(ScheduleError::InvalidSpec(
                        "interval schedule needs interval_seconds > 0".to_string(),
                    ));
                }
            }
            ScheduleType::Once => {
                if self.run_date.is_none() {
                    return Err(ScheduleError::InvalidSpec(
                        "once schedule needs run_date".to_string(),
                    ));
                }
            }
            ScheduleType::Daily => {}
        }
        Ok(())
    }
}

fn valid_task_id(task_id: &str) -> bool {
    !task_id.is_empty()
        && task_id.len() <= 32
        && task_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}
