//! agentd-schedule: typed recurrence engine
//!
//! Fires per-user scheduled tasks (daily, weekly, monthly, interval, once)
//! in each user's timezone, submits them to the task manager, and keeps an
//! append-only operation log alongside the schedule store.

mod error;
mod manager;
mod recurrence;
mod runner;
mod types;

pub use error::{Result, ScheduleError};
pub use manager::{OperationLogEntry, ScheduleManager, ScheduleUpdate};
pub use recurrence::{is_due, next_run};
pub use runner::{RunnerHandle, ScheduleRunner};
pub use types::{ScheduleType, ScheduledTask};
