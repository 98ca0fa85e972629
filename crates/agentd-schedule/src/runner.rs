//! Schedule tick runner
//!
//! Evaluates every user's schedules on a fixed tick, fires the due ones in
//! `(user_id, task_id)` order, and submits each fire to the task manager as
//! a sub-agent task. Missed fires are never executed retroactively; the
//! only immediate fire is an interval task whose first fire time already
//! passed.

use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use agentd_core::{Clock, EventBus, TaskManager, UserRegistry};

use crate::manager::ScheduleManager;
use crate::recurrence::{is_due, next_run};
use crate::types::ScheduledTask;

const DEFAULT_TICK: Duration = Duration::from_secs(30);

/// Handle for stopping a started runner
pub struct RunnerHandle {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl RunnerHandle {
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.await;
    }
}

/// Drives schedule evaluation and firing
pub struct ScheduleRunner {
    manager: Arc<ScheduleManager>,
    tasks: Arc<TaskManager>,
    users: Arc<UserRegistry>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    tick: Duration,
}

impl ScheduleRunner {
    pub fn new(
        manager: Arc<ScheduleManager>,
        tasks: Arc<TaskManager>,
        users: Arc<UserRegistry>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            manager,
            tasks,
            users,
            bus,
            clock,
            tick: DEFAULT_TICK,
        }
    }

    pub fn with_tick_interval(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Spawn the tick loop
    pub fn start(self) -> RunnerHandle {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let tx = shutdown_tx.clone();

        let handle = tokio::spawn(async move {
            info!(tick_seconds = self.tick.as_secs(), "scheduler started");
            let mut ticker = tokio::time::interval(self.tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.run_tick().await,
                    _ = shutdown_rx.recv() => break,
                }
            }
            info!("scheduler stopped");
        });

        RunnerHandle {
            shutdown_tx: tx,
            handle,
        }
    }

    /// Evaluate and fire everything due at the current instant. Users are
    /// visited in id order, tasks in task-id order.
    pub async fn run_tick(&self) {
        let now = self.clock.now_utc();

        for user in self.users.all().await {
            if !user.enabled {
                continue;
            }
            let tz = parse_tz(&user.timezone);

            let schedules = match self.manager.list(user.id).await {
                Ok(schedules) => schedules,
                Err(e) => {
                    error!(user_id = user.id, "cannot load schedules: {}", e);
                    continue;
                }
            };

            for task in schedules {
                if !task.enabled || task.runs_exhausted() {
                    continue;
                }
                if is_due(&task, tz, now) {
                    self.fire(user.id, tz, &task).await;
                }
            }
        }
    }

    /// Submit one fire to the task manager and record it. Failures are
    /// logged and the tick continues.
    async fn fire(&self, user_id: i64, tz: Tz, task: &ScheduledTask) {
        info!(user_id, task_id = %task.task_id, "schedule fired");

        let sub_agent_task_id = match self.tasks.delegate(
            user_id,
            format!("scheduled: {}", task.name),
            task.prompt.clone(),
        ) {
            Ok(id) => id,
            Err(e) => {
                error!(user_id, task_id = %task.task_id, "delegation failed: {}", e);
                return;
            }
        };

        let fired = match self.manager.mark_fired(user_id, &task.task_id).await {
            Ok(fired) => fired,
            Err(e) => {
                error!(user_id, task_id = %task.task_id, "cannot record fire: {}", e);
                return;
            }
        };

        if let Err(e) =
            self.manager
                .log_execution(user_id, &task.task_id, &sub_agent_task_id, fired.run_count)
        {
            error!(user_id, task_id = %task.task_id, "cannot log execution: {}", e);
        }

        let next = next_run(&fired, tz, self.clock.now_utc()).map(|at| at.to_rfc3339());
        self.bus
            .broadcast_schedule_executed(user_id, &task.task_id, fired.run_count, next);
    }
}

fn parse_tz(name: &str) -> Tz {
    name.parse().unwrap_or_else(|_| {
        warn!(timezone = name, "unknown timezone, falling back to UTC");
        chrono_tz::UTC
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ScheduleType, ScheduledTask};
    use agentd_core::{
        ChatAdapter, Event, HostConfig, LlmBackend, LlmError, LlmReply, LlmRequest, ManualClock,
        Outbox, PathLocks, Result as CoreResult, UserPaths,
    };
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    struct OkBackend;

    #[async_trait]
    impl LlmBackend for OkBackend {
        async fn invoke(&self, _request: LlmRequest) -> std::result::Result<LlmReply, LlmError> {
            Ok(LlmReply {
                text: "done".to_string(),
                ..Default::default()
            })
        }

        async fn summarize(&self, _e: &str) -> std::result::Result<String, LlmError> {
            Ok(String::new())
        }
    }

    struct NullAdapter;

    #[async_trait]
    impl ChatAdapter for NullAdapter {
        async fn send_text(&self, _u: i64, _b: &str) -> CoreResult<()> {
            Ok(())
        }
        async fn send_file(
            &self,
            _u: i64,
            _p: &std::path::Path,
            _c: Option<&str>,
        ) -> CoreResult<()> {
            Ok(())
        }
        async fn react(&self, _u: i64, _m: &str, _e: Option<&str>) -> CoreResult<()> {
            Ok(())
        }
        async fn set_typing(&self, _u: i64) -> CoreResult<()> {
            Ok(())
        }
        async fn notify_menu_command_set(
            &self,
            _u: i64,
            _c: &[(String, String)],
        ) -> CoreResult<()> {
            Ok(())
        }
    }

    struct Fixture {
        runner: ScheduleRunner,
        manager: Arc<ScheduleManager>,
        tasks: Arc<TaskManager>,
        users: Arc<UserRegistry>,
        bus: Arc<EventBus>,
        clock: ManualClock,
        _dir: tempfile::TempDir,
    }

    async fn fixture(start: chrono::DateTime<Utc>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let paths = UserPaths::new(dir.path());
        let locks = Arc::new(PathLocks::new());
        let clock = ManualClock::new(start);
        let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());

        let users = Arc::new(UserRegistry::new(paths.clone(), locks.clone(), 1024).unwrap());
        users.get_or_create(1, "alice").await.unwrap();

        let bus = Arc::new(EventBus::default());
        let tasks = Arc::new(TaskManager::new(
            &HostConfig::default(),
            paths.clone(),
            Arc::new(Outbox::new(Arc::new(NullAdapter))),
            bus.clone(),
            Arc::new(OkBackend),
            clock_arc.clone(),
        ));
        let manager = Arc::new(ScheduleManager::new(
            paths,
            locks,
            clock_arc.clone(),
        ));
        let runner = ScheduleRunner::new(
            manager.clone(),
            tasks.clone(),
            users.clone(),
            bus.clone(),
            clock_arc,
        );
        Fixture {
            runner,
            manager,
            tasks,
            users,
            bus,
            clock,
            _dir: dir,
        }
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[tokio::test]
    async fn test_daily_fire_in_user_timezone_with_max_runs() {
        // 09:00 Asia/Shanghai is 01:00 UTC
        let fx = fixture(utc(2026, 3, 1, 0, 0)).await;
        fx.users.set_timezone(1, "Asia/Shanghai").await.unwrap();

        fx.manager
            .create(
                1,
                ScheduledTask::new("brief", "Morning brief", ScheduleType::Daily, "news", utc(2026, 3, 1, 0, 0))
                    .at(9, 0)
                    .with_max_runs(2),
            )
            .await
            .unwrap();

        // Day 1, 09:00 local
        fx.clock.set(utc(2026, 3, 1, 1, 0));
        fx.runner.run_tick().await;
        let task = fx.manager.get(1, "brief").await.unwrap();
        assert_eq!(task.run_count, 1);
        assert!(task.enabled);
        assert_eq!(fx.tasks.list(1).len(), 1);
        assert!(fx.tasks.list(1)[0].description.starts_with("scheduled: "));

        // Same minute again: no double fire
        fx.runner.run_tick().await;
        assert_eq!(fx.manager.get(1, "brief").await.unwrap().run_count, 1);

        // Day 2: second and final run, auto-disabled
        fx.clock.set(utc(2026, 3, 2, 1, 0));
        fx.runner.run_tick().await;
        let task = fx.manager.get(1, "brief").await.unwrap();
        assert_eq!(task.run_count, 2);
        assert!(!task.enabled);

        // Day 3: nothing fires
        fx.clock.set(utc(2026, 3, 3, 1, 0));
        fx.runner.run_tick().await;
        assert_eq!(fx.manager.get(1, "brief").await.unwrap().run_count, 2);
        assert_eq!(fx.tasks.list(1).len(), 2);
    }

    #[tokio::test]
    async fn test_interval_past_first_fire() {
        let start = utc(2026, 3, 1, 12, 0);
        let fx = fixture(start).await;

        fx.manager
            .create(
                1,
                ScheduledTask::new("poll", "Poller", ScheduleType::Interval, "poll it", start)
                    .every_seconds(3600)
                    .starting_at(start - ChronoDuration::seconds(600)),
            )
            .await
            .unwrap();

        // First tick: fires immediately despite the past first_fire_at
        fx.runner.run_tick().await;
        assert_eq!(fx.manager.get(1, "poll").await.unwrap().run_count, 1);

        // Half an interval later: nothing
        fx.clock.set(start + ChronoDuration::seconds(1800));
        fx.runner.run_tick().await;
        assert_eq!(fx.manager.get(1, "poll").await.unwrap().run_count, 1);

        // Full interval after the first fire: fires again
        fx.clock.set(start + ChronoDuration::seconds(3600));
        fx.runner.run_tick().await;
        assert_eq!(fx.manager.get(1, "poll").await.unwrap().run_count, 2);
    }

    #[tokio::test]
    async fn test_no_retroactive_catch_up() {
        let fx = fixture(utc(2026, 3, 1, 0, 0)).await;
        fx.manager
            .create(
                1,
                ScheduledTask::new("brief", "Brief", ScheduleType::Daily, "news", utc(2026, 3, 1, 0, 0))
                    .at(9, 0),
            )
            .await
            .unwrap();

        // The host was down over the 09:00 mark; first tick is at 14:23
        fx.clock.set(utc(2026, 3, 1, 14, 23));
        fx.runner.run_tick().await;
        assert_eq!(fx.manager.get(1, "brief").await.unwrap().run_count, 0);

        // Next day's 09:00 fires normally
        fx.clock.set(utc(2026, 3, 2, 9, 0));
        fx.runner.run_tick().await;
        assert_eq!(fx.manager.get(1, "brief").await.unwrap().run_count, 1);
    }

    #[tokio::test]
    async fn test_schedule_executed_event_published() {
        let fx = fixture(utc(2026, 3, 1, 8, 59)).await;
        let (_id, mut rx) = fx.bus.subscribe(1);

        fx.manager
            .create(
                1,
                ScheduledTask::new("brief", "Brief", ScheduleType::Daily, "news", utc(2026, 3, 1, 0, 0))
                    .at(9, 0),
            )
            .await
            .unwrap();

        fx.clock.set(utc(2026, 3, 1, 9, 0));
        fx.runner.run_tick().await;

        // Skip task lifecycle events until the schedule event arrives
        loop {
            match rx.recv().await {
                Some(Event::ScheduleExecuted {
                    task_id,
                    run_count,
                    next_run,
                }) => {
                    assert_eq!(task_id, "brief");
                    assert_eq!(run_count, 1);
                    assert_eq!(
                        next_run.as_deref(),
                        Some(utc(2026, 3, 2, 9, 0).to_rfc3339().as_str())
                    );
                    break;
                }
                Some(_) => continue,
                None => panic!("bus closed before schedule_executed"),
            }
        }
    }

    #[tokio::test]
    async fn test_execution_log_written() {
        let fx = fixture(utc(2026, 3, 1, 9, 0)).await;
        fx.manager
            .create(
                1,
                ScheduledTask::new("brief", "Brief", ScheduleType::Daily, "news", utc(2026, 3, 1, 0, 0))
                    .at(9, 0),
            )
            .await
            .unwrap();

        fx.runner.run_tick().await;

        let log = fx.manager.operation_log(1, 10).unwrap();
        assert_eq!(log[0].action, "execute");
        let sub_id = log[0].details.as_ref().unwrap()["sub_agent_task_id"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(fx.tasks.get(&sub_id).is_some());
    }

    #[tokio::test]
    async fn test_disabled_task_never_fires() {
        let fx = fixture(utc(2026, 3, 1, 9, 0)).await;
        fx.manager
            .create(
                1,
                ScheduledTask::new("brief", "Brief", ScheduleType::Daily, "news", utc(2026, 3, 1, 0, 0))
                    .at(9, 0),
            )
            .await
            .unwrap();
        fx.manager.disable(1, "brief").await.unwrap();

        fx.runner.run_tick().await;
        assert_eq!(fx.manager.get(1, "brief").await.unwrap().run_count, 0);
        assert!(fx.tasks.list(1).is_empty());
    }

    #[tokio::test]
    async fn test_runner_start_stop() {
        let fx = fixture(utc(2026, 3, 1, 0, 0)).await;
        let handle = fx.runner.with_tick_interval(Duration::from_millis(10)).start();
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.stop().await;
    }
}
