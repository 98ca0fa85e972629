//! REST API types and handlers
//!
//! Read-only queries for the dashboard front-end. Data comes through
//! provider traits so the crate stays decoupled from the host's internals.

use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use agentd_core::{EventBus, StorageReport};

use crate::ws::websocket_handler;

/// Task information for display
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: String,
    pub description: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub files_produced: Vec<String>,
}

/// Schedule information for display
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleInfo {
    pub task_id: String,
    pub name: String,
    pub schedule_type: String,
    pub enabled: bool,
    pub run_count: u32,
    pub max_runs: Option<u32>,
    pub next_run: Option<String>,
}

/// Sub-agent task data provider
#[async_trait]
pub trait TaskProvider: Send + Sync {
    async fn tasks_for(&self, user_id: i64) -> Vec<TaskInfo>;
}

/// Schedule data provider
#[async_trait]
pub trait ScheduleProvider: Send + Sync {
    async fn schedules_for(&self, user_id: i64) -> Vec<ScheduleInfo>;
}

/// Storage usage provider
#[async_trait]
pub trait StorageProvider: Send + Sync {
    async fn storage_for(&self, user_id: i64) -> Option<StorageReport>;
}

/// Shared state for all dashboard handlers
#[derive(Clone)]
pub struct DashboardState {
    pub tasks: Arc<dyn TaskProvider>,
    pub schedules: Arc<dyn ScheduleProvider>,
    pub storage: Arc<dyn StorageProvider>,
    pub bus: Arc<EventBus>,
}

impl DashboardState {
    pub fn new(
        tasks: Arc<dyn TaskProvider>,
        schedules: Arc<dyn ScheduleProvider>,
        storage: Arc<dyn StorageProvider>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            tasks,
            schedules,
            storage,
            bus,
        }
    }
}

/// Create the dashboard router
pub fn create_router(state: DashboardState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/users/{id}/tasks", get(list_tasks))
        .route("/api/users/{id}/schedules", get(list_schedules))
        .route("/api/users/{id}/storage", get(get_storage))
        .route("/ws/{id}", get(websocket_handler))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        .with_state(Arc::new(state))
}

async fn list_tasks(
    State(state): State<Arc<DashboardState>>,
    Path(user_id): Path<i64>,
) -> Json<Vec<TaskInfo>> {
    Json(state.tasks.tasks_for(user_id).await)
}

async fn list_schedules(
    State(state): State<Arc<DashboardState>>,
    Path(user_id): Path<i64>,
) -> Json<Vec<ScheduleInfo>> {
    Json(state.schedules.schedules_for(user_id).await)
}

async fn get_storage(
    State(state): State<Arc<DashboardState>>,
    Path(user_id): Path<i64>,
) -> Result<Json<StorageReport>, StatusCode> {
    state
        .storage
        .storage_for(user_id)
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "agentd-dashboard"
    }))
}
