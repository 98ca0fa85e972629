//! Dashboard provider implementations over the host's managers

use std::sync::Arc;

use async_trait::async_trait;
use chrono_tz::Tz;

use agentd_core::{
    Clock, DiskQuotaGate, QuotaGate, StorageReport, TaskManager, UserRegistry,
};
use agentd_dashboard::{ScheduleInfo, ScheduleProvider, StorageProvider, TaskInfo, TaskProvider};
use agentd_schedule::{next_run, ScheduleManager};

pub struct HostProviders {
    tasks: Arc<TaskManager>,
    schedules: Arc<ScheduleManager>,
    users: Arc<UserRegistry>,
    quota: Arc<DiskQuotaGate>,
    clock: Arc<dyn Clock>,
}

impl HostProviders {
    pub fn new(
        tasks: Arc<TaskManager>,
        schedules: Arc<ScheduleManager>,
        users: Arc<UserRegistry>,
        quota: Arc<DiskQuotaGate>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tasks,
            schedules,
            users,
            quota,
            clock,
        }
    }

    async fn user_tz(&self, user_id: i64) -> Tz {
        self.users
            .get(user_id)
            .await
            .and_then(|user| user.timezone.parse().ok())
            .unwrap_or(chrono_tz::UTC)
    }
}

#[async_trait]
impl TaskProvider for HostProviders {
    async fn tasks_for(&self, user_id: i64) -> Vec<TaskInfo> {
        self.tasks
            .list(user_id)
            .into_iter()
            .map(|task| TaskInfo {
                task_id: task.task_id,
                description: task.description,
                status: task.status.as_str().to_string(),
                created_at: task.created_at,
                completed_at: task.completed_at,
                files_produced: task.files_produced,
            })
            .collect()
    }
}

#[async_trait]
impl ScheduleProvider for HostProviders {
    async fn schedules_for(&self, user_id: i64) -> Vec<ScheduleInfo> {
        let tz = self.user_tz(user_id).await;
        let now = self.clock.now_utc();
        self.schedules
            .list(user_id)
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|task| ScheduleInfo {
                next_run: next_run(&task, tz, now).map(|at| at.to_rfc3339()),
                task_id: task.task_id,
                name: task.name,
                schedule_type: task.schedule_type.as_str().to_string(),
                enabled: task.enabled,
                run_count: task.run_count,
                max_runs: task.max_runs,
            })
            .collect()
    }
}

#[async_trait]
impl StorageProvider for HostProviders {
    async fn storage_for(&self, user_id: i64) -> Option<StorageReport> {
        self.quota.report(user_id).await.ok()
    }
}
