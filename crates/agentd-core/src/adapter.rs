//! Chat adapter contract and per-user outbound queue
//!
//! The transport (Telegram, Slack, whatever fronts the host) implements
//! [`ChatAdapter`]. All outbound traffic for a user flows through that
//! user's [`Outbox`] queue, which is the authoritative serialization point
//! for user-visible effects: messages and files arrive in enqueue order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error};

use crate::error::Result;

/// Longest text chunk sent as a single message
const MAX_TEXT_CHUNK: usize = 4000;

/// Outbound transport operations, implemented by the chat front-end
#[async_trait]
pub trait ChatAdapter: Send + Sync {
    async fn send_text(&self, user_id: i64, body: &str) -> Result<()>;

    async fn send_file(&self, user_id: i64, path: &Path, caption: Option<&str>) -> Result<()>;

    async fn react(&self, user_id: i64, message_ref: &str, emoji: Option<&str>) -> Result<()>;

    async fn set_typing(&self, user_id: i64) -> Result<()>;

    async fn notify_menu_command_set(&self, user_id: i64, commands: &[(String, String)])
        -> Result<()>;
}

enum Outbound {
    Text(String),
    File {
        path: PathBuf,
        caption: Option<String>,
        /// Delete the file once sent (archives are not user content)
        transient: bool,
    },
}

/// Per-user FIFO queues over a [`ChatAdapter`]
///
/// Adapter failures are logged and swallowed; they never fail the
/// originating task.
pub struct Outbox {
    adapter: Arc<dyn ChatAdapter>,
    queues: Mutex<HashMap<i64, mpsc::UnboundedSender<Outbound>>>,
}

impl Outbox {
    pub fn new(adapter: Arc<dyn ChatAdapter>) -> Self {
        Self {
            adapter,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Queue a text message; long texts are split into ordered chunks
    pub async fn send_text(&self, user_id: i64, body: &str) {
        let sender = self.sender_for(user_id).await;
        for chunk in split_chunks(body, MAX_TEXT_CHUNK) {
            if sender.send(Outbound::Text(chunk)).is_err() {
                error!(user_id, "outbox worker gone, dropping message");
                return;
            }
        }
    }

    /// Queue a file delivery
    pub async fn send_file(&self, user_id: i64, path: impl Into<PathBuf>, caption: Option<String>) {
        self.enqueue_file(user_id, path.into(), caption, false).await;
    }

    /// Queue a file delivery and delete the file once it has been sent
    pub async fn send_transient_file(
        &self,
        user_id: i64,
        path: impl Into<PathBuf>,
        caption: Option<String>,
    ) {
        self.enqueue_file(user_id, path.into(), caption, true).await;
    }

    async fn enqueue_file(
        &self,
        user_id: i64,
        path: PathBuf,
        caption: Option<String>,
        transient: bool,
    ) {
        let sender = self.sender_for(user_id).await;
        if sender
            .send(Outbound::File {
                path,
                caption,
                transient,
            })
            .is_err()
        {
            error!(user_id, "outbox worker gone, dropping file");
        }
    }

    async fn sender_for(&self, user_id: i64) -> mpsc::UnboundedSender<Outbound> {
        let mut queues = self.queues.lock().await;
        if let Some(sender) = queues.get(&user_id) {
            if !sender.is_closed() {
                return sender.clone();
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = self.adapter.clone();
        tokio::spawn(run_worker(user_id, adapter, rx));
        queues.insert(user_id, tx.clone());
        tx
    }
}

async fn run_worker(
    user_id: i64,
    adapter: Arc<dyn ChatAdapter>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(message) = rx.recv().await {
        let result = match &message {
            Outbound::Text(body) => adapter.send_text(user_id, body).await,
            Outbound::File { path, caption, .. } => {
                adapter.send_file(user_id, path, caption.as_deref()).await
            }
        };
        if let Err(e) = result {
            error!(user_id, "outbound send failed: {}", e);
        }
        if let Outbound::File {
            path,
            transient: true,
            ..
        } = &message
        {
            if let Err(e) = std::fs::remove_file(path) {
                debug!(user_id, "failed to remove transient file: {}", e);
            }
        }
    }
    debug!(user_id, "outbox worker stopped");
}

fn split_chunks(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let mut end = rest.len().min(max_len);
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        chunks.push(rest[..end].to_string());
        rest = &rest[end..];
    }
    chunks
}
