//! Logging chat adapter
//!
//! Stand-in transport used when no chat front-end is wired up: outbound
//! traffic is logged instead of delivered. A real deployment implements
//! `ChatAdapter` over its messaging platform and passes it to the host.

use std::path::Path;

use async_trait::async_trait;
use tracing::info;

use agentd_core::{ChatAdapter, Result};

pub struct LogAdapter;

#[async_trait]
impl ChatAdapter for LogAdapter {
    async fn send_text(&self, user_id: i64, body: &str) -> Result<()> {
        info!(user_id, "outbound text: {}", body);
        Ok(())
    }

    async fn send_file(&self, user_id: i64, path: &Path, caption: Option<&str>) -> Result<()> {
        info!(user_id, file = %path.display(), caption, "outbound file");
        Ok(())
    }

    async fn react(&self, user_id: i64, message_ref: &str, emoji: Option<&str>) -> Result<()> {
        info!(user_id, message_ref, emoji, "outbound reaction");
        Ok(())
    }

    async fn set_typing(&self, user_id: i64) -> Result<()> {
        info!(user_id, "typing indicator");
        Ok(())
    }

    async fn notify_menu_command_set(
        &self,
        user_id: i64,
        commands: &[(String, String)],
    ) -> Result<()> {
        info!(user_id, count = commands.len(), "menu commands updated");
        Ok(())
    }
}
