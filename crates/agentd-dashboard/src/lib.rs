//! agentd-dashboard: dashboard surface over the event bus
//!
//! Serves the per-user event stream over WebSocket and a handful of
//! read-only REST queries backed by provider traits the host implements.
//! There is no backlog replay: reconnecting clients re-query current state
//! through the REST endpoints.

mod api;
mod error;
mod server;
mod ws;

pub use api::{
    create_router, DashboardState, ScheduleInfo, ScheduleProvider, StorageProvider, TaskInfo,
    TaskProvider,
};
pub use error::{DashboardError, Result};
pub use server::DashboardServer;
