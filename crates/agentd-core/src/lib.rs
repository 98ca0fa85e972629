//! agentd-core: Agent Host Core Library
//!
//! Provides the execution substrate for the agent host: session and
//! conversation lifecycle, the sub-agent task manager with its review loop,
//! per-task file tracking, the per-user event bus, the memory store, and the
//! shared persistence/quota primitives everything else builds on.

pub mod adapter;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod host;
pub mod llm;
pub mod memory;
pub mod session;
pub mod store;
pub mod tasks;
pub mod tracker;
pub mod users;

pub use adapter::{ChatAdapter, Outbox};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, DashboardConfig, HostConfig, LlmConfig};
pub use error::{Error, Result};
pub use events::{Event, EventBus, SubscriberId};
pub use host::{AgentHost, ScheduleCreateSpec, ScheduleSink, ToolIntent};
pub use llm::{HttpBackend, LlmBackend, LlmError, LlmReply, LlmRequest, ToolCallIntent, Usage};
pub use memory::{
    Memory, MemoryCategory, MemoryStats, MemoryStore, NewMemory, SearchQuery, SourceType,
    Visibility,
};
pub use session::{ChatLogger, ChatRole, ChatSummary, ExpiryReason, Session, SessionManager};
pub use store::{
    DiskQuotaGate, PathLocks, QuotaDecision, QuotaGate, StorageReport, UserPaths,
};
pub use tasks::{ReviewAgent, ReviewVerdict, SubAgentTask, TaskManager, TaskStatus};
pub use tracker::FileTrackerScope;
pub use users::{User, UserRegistry};
