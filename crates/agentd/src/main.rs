//! agentd: Agent Host Main Binary
//!
//! Usage:
//!   agentd             - Start the host (scheduler + dashboard + event bus)
//!   agentd --help      - Show help
//!   agentd --version   - Show version

mod adapter;
mod providers;

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use agentd_core::{AgentHost, Config, HttpBackend, SystemClock};
use agentd_dashboard::{DashboardServer, DashboardState};
use agentd_schedule::{ScheduleManager, ScheduleRunner};

use adapter::LogAdapter;
use providers::HostProviders;

/// How often the retention sweep runs
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
/// Terminal tasks stay in the in-memory index this long
const TASK_INDEX_RETENTION_SECONDS: i64 = 24 * 60 * 60;
/// Completed-task documents are kept this long
const TASK_DOCUMENT_RETENTION_DAYS: u64 = 7;
/// Chat logs and summaries are kept this long
const CHAT_LOG_RETENTION_DAYS: i64 = 30;

enum RunMode {
    Server,
    Help,
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match parse_args() {
        RunMode::Help => {
            print_help();
            return Ok(());
        }
        RunMode::Version => {
            println!("agentd {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        RunMode::Server => {}
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    // .env first so it can provide the API key the config requires
    dotenvy::dotenv().ok();

    let config = Config::load().map_err(|e| anyhow::anyhow!("config error: {}", e))?;
    tracing::info!("starting agentd");
    tracing::info!("model: {}", config.llm.model);
    tracing::info!("data root: {}", config.host.data_root.display());

    run_server(config).await
}

fn parse_args() -> RunMode {
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--help" | "-h" => return RunMode::Help,
            "--version" | "-v" => return RunMode::Version,
            other => {
                eprintln!("unknown argument: {}", other);
                return RunMode::Help;
            }
        }
    }
    RunMode::Server
}

fn print_help() {
    println!("agentd - multi-tenant conversational agent host");
    println!();
    println!("Usage:");
    println!("  agentd             Start the host");
    println!("  agentd --help      Show this help message");
    println!("  agentd --version   Show version");
    println!();
    println!("Environment variables:");
    println!("  LLM_API_KEY                 API key (required)");
    println!("  LLM_MODEL                   Model name");
    println!("  LLM_BASE_URL                Custom backend endpoint");
    println!("  AGENTD_DATA_ROOT            State directory (default: data)");
    println!("  AGENTD_SESSION_TIMEOUT      Session timeout seconds (default: 3600)");
    println!("  AGENTD_MAX_SUB_AGENTS       Concurrent sub-agent cap (default: 10)");
    println!("  AGENTD_MAX_RETRIES          Review retry cap (default: 10)");
    println!("  DASHBOARD_HOST / DASHBOARD_PORT");
    println!();
    println!("Values can also be set in agentd.toml; environment wins.");
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    let backend = Arc::new(
        HttpBackend::new(&config.llm)
            .map_err(|e| anyhow::anyhow!("failed to create LLM backend: {}", e))?,
    );
    let clock = Arc::new(SystemClock);

    let host = Arc::new(
        AgentHost::new(&config, backend, Arc::new(LogAdapter), clock.clone())
            .map_err(|e| anyhow::anyhow!("failed to build host: {}", e))?,
    );

    // Event bus keepalive sweep
    let keepalive = host.events.start_keepalive();

    // Scheduler shares the host's path layout and lock table
    let schedules = Arc::new(ScheduleManager::new(
        host.paths().clone(),
        host.locks(),
        clock.clone(),
    ));
    // Route schedule_create tool intents into the scheduler
    host.set_schedule_sink(schedules.clone());
    let runner_handle = ScheduleRunner::new(
        schedules.clone(),
        host.tasks.clone(),
        host.users.clone(),
        host.events.clone(),
        clock.clone(),
    )
    .start();
    tracing::info!("scheduler started");

    // Daily retention sweep over the task index, completed-task documents,
    // and archived chat logs
    let sweep_host = host.clone();
    let retention_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first interval tick completes immediately; skip it
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed_tasks = sweep_host.tasks.cleanup_old_tasks(TASK_INDEX_RETENTION_SECONDS);
            let mut removed_files = 0;
            for user in sweep_host.users.all().await {
                removed_files += sweep_host
                    .tasks
                    .cleanup_old_task_documents(user.id, TASK_DOCUMENT_RETENTION_DAYS);
                removed_files += sweep_host
                    .sessions
                    .chat_logger()
                    .cleanup_old_logs(user.id, CHAT_LOG_RETENTION_DAYS);
            }
            tracing::info!(removed_tasks, removed_files, "retention sweep finished");
        }
    });

    // Dashboard server
    let providers = Arc::new(HostProviders::new(
        host.tasks.clone(),
        schedules.clone(),
        host.users.clone(),
        host.quota.clone(),
        clock,
    ));
    let state = DashboardState::new(
        providers.clone(),
        providers.clone(),
        providers,
        host.events.clone(),
    );
    let dashboard = DashboardServer::new(config.dashboard.clone(), state);
    let dashboard_handle = tokio::spawn(async move {
        if let Err(e) = dashboard.run().await {
            tracing::error!("dashboard error: {}", e);
        }
    });

    tracing::info!("agentd initialized, press Ctrl+C to exit");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down...");

    runner_handle.stop().await;
    host.shutdown();
    dashboard_handle.abort();
    retention_handle.abort();
    keepalive.abort();

    tracing::info!("shutdown complete");
    Ok(())
}
