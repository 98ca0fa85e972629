//! Configuration management
//!
//! Configuration is read from environment variables, optionally overlaid on
//! an `agentd.toml` file. Environment variables win over the file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// LLM backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// API key
    #[serde(default)]
    pub api_key: String,

    /// Model to use
    #[serde(default = "default_model")]
    pub model: String,

    /// Base URL (optional, for custom endpoints)
    pub base_url: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
            base_url: None,
        }
    }
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

/// Host behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Root directory holding `users/` plus the shared state files
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,

    /// Session inactivity timeout in seconds (0 disables expiry)
    #[serde(default = "default_session_timeout")]
    pub session_timeout_seconds: u64,

    /// Staleness threshold after which context recovery is attached
    #[serde(default = "default_context_stale")]
    pub context_stale_seconds: u64,

    /// Global cap on concurrently running sub-agent tasks
    #[serde(default = "default_max_sub_agents")]
    pub max_sub_agents: usize,

    /// Maximum review-loop retries per task
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Files above this count are delivered as a single archive
    #[serde(default = "default_inline_threshold")]
    pub inline_file_threshold: usize,

    /// Event bus keepalive ping interval in seconds
    #[serde(default = "default_ping_interval")]
    pub ping_interval_seconds: u64,

    /// Default per-user storage quota in bytes
    #[serde(default = "default_quota_bytes")]
    pub default_quota_bytes: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            session_timeout_seconds: default_session_timeout(),
            context_stale_seconds: default_context_stale(),
            max_sub_agents: default_max_sub_agents(),
            max_retries: default_max_retries(),
            inline_file_threshold: default_inline_threshold(),
            ping_interval_seconds: default_ping_interval(),
            default_quota_bytes: default_quota_bytes(),
        }
    }
}

fn default_data_root() -> PathBuf {
    PathBuf::from("data")
}

fn default_session_timeout() -> u64 {
    3600
}

fn default_context_stale() -> u64 {
    600
}

fn default_max_sub_agents() -> usize {
    10
}

fn default_max_retries() -> u32 {
    10
}

fn default_inline_threshold() -> usize {
    5
}

fn default_ping_interval() -> u64 {
    30
}

fn default_quota_bytes() -> u64 {
    5 * 1024 * 1024 * 1024
}

/// Dashboard server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardConfig {
    /// Server host
    #[serde(default = "default_dashboard_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_dashboard_port")]
    pub port: u16,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            host: default_dashboard_host(),
            port: default_dashboard_port(),
        }
    }
}

fn default_dashboard_host() -> String {
    "127.0.0.1".to_string()
}

fn default_dashboard_port() -> u16 {
    3000
}

/// Main configuration for agentd
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// LLM backend configuration
    #[serde(default)]
    pub llm: LlmConfig,

    /// Host behavior configuration
    #[serde(default)]
    pub host: HostConfig,

    /// Dashboard server configuration
    #[serde(default)]
    pub dashboard: DashboardConfig,
}

impl Config {
    /// Load configuration: `agentd.toml` if present, then environment overrides
    pub fn load() -> Result<Self> {
        let mut config = match std::fs::read_to_string("agentd.toml") {
            Ok(text) => toml::from_str(&text)
                .map_err(|e| Error::Config(format!("agentd.toml: {}", e)))?,
            Err(_) => Config::default(),
        };
        config.apply_env();
        if config.llm.api_key.is_empty() {
            return Err(Error::Config(
                "LLM_API_KEY not set and no api_key in agentd.toml".to_string(),
            ));
        }
        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env();
        if config.llm.api_key.is_empty() {
            return Err(Error::Config("LLM_API_KEY not set".to_string()));
        }
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("LLM_API_KEY") {
            self.llm.api_key = key;
        }
        if let Ok(model) = std::env::var("LLM_MODEL") {
            self.llm.model = model;
        }
        if let Ok(url) = std::env::var("LLM_BASE_URL") {
            self.llm.base_url = Some(url);
        }
        if let Ok(root) = std::env::var("AGENTD_DATA_ROOT") {
            self.host.data_root = PathBuf::from(root);
        }
        if let Some(v) = env_parse("AGENTD_SESSION_TIMEOUT") {
            self.host.session_timeout_seconds = v;
        }
        if let Some(v) = env_parse("AGENTD_MAX_SUB_AGENTS") {
            self.host.max_sub_agents = v;
        }
        if let Some(v) = env_parse("AGENTD_MAX_RETRIES") {
            self.host.max_retries = v;
        }
        if let Some(v) = env_parse("AGENTD_INLINE_FILE_THRESHOLD") {
            self.host.inline_file_threshold = v;
        }
        if let Some(v) = env_parse("AGENTD_PING_INTERVAL") {
            self.host.ping_interval_seconds = v;
        }
        if let Some(v) = env_parse("AGENTD_DEFAULT_QUOTA_BYTES") {
            self.host.default_quota_bytes = v;
        }
        if let Ok(host) = std::env::var("DASHBOARD_HOST") {
            self.dashboard.host = host;
        }
        if let Some(v) = env_parse("DASHBOARD_PORT") {
            self.dashboard.port = v;
        }
    }

    /// Config rooted at a specific data directory (used heavily in tests)
    pub fn with_data_root(root: impl AsRef<Path>) -> Self {
        let mut config = Config::default();
        config.host.data_root = root.as_ref().to_path_buf();
        config
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.host.session_timeout_seconds, 3600);
        assert_eq!(config.host.max_sub_agents, 10);
        assert_eq!(config.host.max_retries, 10);
        assert_eq!(config.host.inline_file_threshold, 5);
        assert_eq!(config.host.ping_interval_seconds, 30);
        assert_eq!(config.dashboard.port, 3000);
    }

    #[test]
    fn test_toml_roundtrip() {
        let text = r#"
            [llm]
            api_key = "test-key"
            model = "test-model"

            [host]
            max_sub_agents = 2
        "#;
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.llm.api_key, "test-key");
        assert_eq!(config.host.max_sub_agents, 2);
        // Unspecified fields fall back to defaults
        assert_eq!(config.host.max_retries, 10);
    }

    #[test]
    fn test_with_data_root() {
        let config = Config::with_data_root("/tmp/agentd-test");
        assert_eq!(config.host.data_root, PathBuf::from("/tmp/agentd-test"));
    }
}
