//! Recurrence evaluation
//!
//! Wall-clock rules (daily, weekly, monthly, once) are evaluated in the
//! user's timezone; interval rules run on UTC elapsed time. A task fires at
//! most once per matching minute, guarded by `last_run`.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::types::{ScheduleType, ScheduledTask};

/// Should this task fire at `now_utc`? Enabled/max-run checks belong to
/// the caller.
pub fn is_due(task: &ScheduledTask, tz: Tz, now_utc: DateTime<Utc>) -> bool {
    match task.schedule_type {
        ScheduleType::Interval => interval_due(task, now_utc),
        ScheduleType::Daily => clock_due(task, tz, now_utc),
        ScheduleType::Weekly => {
            clock_due(task, tz, now_utc) && weekday_matches(task, tz, now_utc)
        }
        ScheduleType::Monthly => {
            clock_due(task, tz, now_utc) && month_day_matches(task, tz, now_utc)
        }
        ScheduleType::Once => {
            task.run_count == 0
                && clock_due(task, tz, now_utc)
                && task.run_date == Some(now_utc.with_timezone(&tz).date_naive())
        }
    }
}

/// Forward-looking next fire time; `None` when the task will never fire
/// again
pub fn next_run(task: &ScheduledTask, tz: Tz, now_utc: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if task.runs_exhausted() {
        return None;
    }
    match task.schedule_type {
        ScheduleType::Interval => {
            let interval = Duration::seconds(task.interval_seconds? as i64);
            let candidate = match task.last_run {
                Some(last) => last + interval,
                None => task.first_fire_at.unwrap_or(now_utc),
            };
            Some(candidate.max(now_utc))
        }
        ScheduleType::Daily => next_local_match(task, tz, now_utc, |_| true),
        ScheduleType::Weekly => next_local_match(task, tz, now_utc, |date| {
            task.weekdays
                .as_ref()
                .map(|days| days.contains(&(date.weekday().num_days_from_monday() as u8)))
                .unwrap_or(false)
        }),
        ScheduleType::Monthly => next_local_match(task, tz, now_utc, |date| {
            Some(date.day()) == task.month_day
        }),
        ScheduleType::Once => {
            if task.run_count > 0 {
                return None;
            }
            let date = task.run_date?;
            let at = local_time_on(date, task.hour, task.minute, tz)?;
            (at > now_utc).then_some(at)
        }
    }
}

/// Local wall-clock hour/minute match, at most one fire per minute
fn clock_due(task: &ScheduledTask, tz: Tz, now_utc: DateTime<Utc>) -> bool {
    let local = now_utc.with_timezone(&tz);
    if local.hour() != task.hour || local.minute() != task.minute {
        return false;
    }
    match task.last_run {
        Some(last) => last < minute_start(now_utc),
        None => true,
    }
}

fn weekday_matches(task: &ScheduledTask, tz: Tz, now_utc: DateTime<Utc>) -> bool {
    let weekday = now_utc
        .with_timezone(&tz)
        .weekday()
        .num_days_from_monday() as u8;
    task.weekdays
        .as_ref()
        .map(|days| days.contains(&weekday))
        .unwrap_or(false)
}

/// Months without the configured day are skipped entirely
fn month_day_matches(task: &ScheduledTask, tz: Tz, now_utc: DateTime<Utc>) -> bool {
    Some(now_utc.with_timezone(&tz).day()) == task.month_day
}

fn interval_due(task: &ScheduledTask, now_utc: DateTime<Utc>) -> bool {
    let Some(interval_seconds) = task.interval_seconds else {
        return false;
    };
    if let Some(first) = task.first_fire_at {
        if now_utc < first {
            return false;
        }
    }
    match task.last_run {
        // A past (or unset) first_fire_at fires once immediately
        None => true,
        Some(last) => now_utc - last >= Duration::seconds(interval_seconds as i64),
    }
}

fn minute_start(now_utc: DateTime<Utc>) -> DateTime<Utc> {
    now_utc - Duration::seconds(now_utc.second() as i64)
        - Duration::nanoseconds(now_utc.nanosecond() as i64)
}

fn next_local_match(
    task: &ScheduledTask,
    tz: Tz,
    now_utc: DateTime<Utc>,
    date_ok: impl Fn(NaiveDate) -> bool,
) -> Option<DateTime<Utc>> {
    let local_now = now_utc.with_timezone(&tz);
    let mut date = local_now.date_naive();
    // Bounded scan covers the longest monthly gap (day 31 across Feb)
    for _ in 0..=62 {
        if date_ok(date) {
            if let Some(at) = local_time_on(date, task.hour, task.minute, tz) {
                if at > now_utc {
                    return Some(at);
                }
            }
        }
        date = date.succ_opt()?;
    }
    None
}

fn local_time_on(date: NaiveDate, hour: u32, minute: u32, tz: Tz) -> Option<DateTime<Utc>> {
    let naive = date.and_hms_opt(hour, minute, 0)?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}
