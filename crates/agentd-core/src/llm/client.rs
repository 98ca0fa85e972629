//! HTTP client implementation of the LLM backend

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::LlmConfig;

use super::types::{LlmBackend, LlmError, LlmReply, LlmRequest, ToolCallIntent, Usage};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

/// LLM backend over HTTP
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl HttpBackend {
    pub fn new(config: &LlmConfig) -> std::result::Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn post(
        &self,
        body: &WireRequest,
        cancel: Option<&tokio_util::sync::CancellationToken>,
    ) -> std::result::Result<WireResponse, LlmError> {
        let url = format!("{}/messages", self.base_url);
        debug!(model = %body.model, "sending backend request");

        let send = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send();

        let response = match cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => {
                    return Err(LlmError::Transport("request cancelled".to_string()));
                }
                result = send => result,
            },
            None => send.await,
        }
        .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        if !status.is_success() {
            warn!(%status, "backend error: {}", text);
            return Err(map_error(status, &text, body.session.is_some()));
        }

        serde_json::from_str(&text)
            .map_err(|e| LlmError::Transport(format!("bad response body: {}", e)))
    }
}

fn map_error(status: StatusCode, body: &str, had_session: bool) -> LlmError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimit(body.to_string()),
        StatusCode::NOT_FOUND if had_session => LlmError::RemoteUnknown,
        StatusCode::BAD_REQUEST => {
            // Some deployments report expired sessions as a 400 with a marker
            if had_session && body.contains("session") && body.contains("not found") {
                LlmError::RemoteUnknown
            } else {
                LlmError::InvalidRequest(body.to_string())
            }
        }
        _ => LlmError::Transport(format!("{}: {}", status, body)),
    }
}

#[async_trait]
impl LlmBackend for HttpBackend {
    async fn invoke(&self, request: LlmRequest) -> std::result::Result<LlmReply, LlmError> {
        let mut prompt = request.prompt.clone();
        if let Some(context) = &request.context {
            prompt = format!("{}\n\n{}", context, prompt);
        }

        let body = WireRequest {
            model: self.model.clone(),
            max_tokens: 4096,
            system: request.system.clone(),
            session: request.remote_id.clone(),
            messages: vec![WireMessage {
                role: "user".to_string(),
                content: prompt,
            }],
        };

        let response = self.post(&body, Some(&request.cancel)).await?;
        Ok(response.into_reply())
    }

    async fn summarize(&self, excerpt: &str) -> std::result::Result<String, LlmError> {
        let body = WireRequest {
            model: self.model.clone(),
            max_tokens: 1024,
            system: None,
            session: None,
            messages: vec![WireMessage {
                role: "user".to_string(),
                content: format!(
                    "Summarize this conversation so a future session can pick it up \
                     seamlessly. Cover key topics, decisions, unfinished work, and any \
                     facts worth carrying forward.\n\n{}",
                    excerpt
                ),
            }],
        };

        let response = self.post(&body, None).await?;
        Ok(response.into_reply().text)
    }
}

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<String>,
    messages: Vec<WireMessage>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    content: Vec<WireContent>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireContent {
    Text { text: String },
    ToolUse { name: String, input: serde_json::Value },
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cost_usd: f64,
}

impl WireResponse {
    fn into_reply(self) -> LlmReply {
        let mut text_parts = Vec::new();
        let mut tool_calls = Vec::new();
        for item in self.content {
            match item {
                WireContent::Text { text } => text_parts.push(text),
                WireContent::ToolUse { name, input } => tool_calls.push(ToolCallIntent {
                    name,
                    arguments: input,
                }),
            }
        }
        let usage = self
            .usage
            .map(|u| Usage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
                cost_usd: u.cost_usd,
            })
            .unwrap_or_default();
        LlmReply {
            text: text_parts.join("\n"),
            tool_calls,
            usage,
            remote_id: self.session_id,
        }
    }
}
