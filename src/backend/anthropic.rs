//! Backend for the Anthropic Messages API.
//!
//! Endpoint: `/v1/messages` with `x-api-key` and `anthropic-version`
//! headers. System messages are lifted into the top-level `system` field;
//! cache token counts map onto the usage `cache_read`/`cache_write` fields.

use super::{Backend, Completion};
use crate::error::{Result, RlmError};
use crate::protocol::{LmRequest, Role, Usage};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Backend for the Anthropic Messages API.
#[derive(Clone, Default)]
pub struct AnthropicBackend {
    api_key: Option<String>,
}

impl std::fmt::Debug for AnthropicBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicBackend")
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .finish()
    }
}

impl AnthropicBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend keyed from the `ANTHROPIC_API_KEY` environment
    /// variable, unauthenticated if unset.
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// The Messages API takes system text as a top-level field, not a
    /// message role.
    fn build_body(request: &LmRequest, model: &str) -> Value {
        let mut system = String::new();
        let mut messages = Vec::new();
        for m in &request.messages {
            match m.role {
                Role::System => {
                    if !system.is_empty() {
                        system.push('\n');
                    }
                    system.push_str(&m.content);
                }
                Role::User => messages.push(json!({"role": "user", "content": m.content})),
                Role::Assistant => {
                    messages.push(json!({"role": "assistant", "content": m.content}))
                }
            }
        }

        let mut body = json!({
            "model": model,
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        body
    }

    fn parse_retry_after(value: &str) -> Option<std::time::Duration> {
        value
            .trim()
            .parse::<u64>()
            .ok()
            .map(std::time::Duration::from_secs)
    }
}

#[async_trait]
impl Backend for AnthropicBackend {
    async fn complete(
        &self,
        client: &Client,
        base_url: &str,
        request: &LmRequest,
    ) -> Result<Completion> {
        let model = request
            .model
            .as_deref()
            .ok_or_else(|| RlmError::InvalidConfig("request has no routed model".into()))?;
        let url = format!("{}/v1/messages", base_url.trim_end_matches('/'));
        let body = Self::build_body(request, model);

        let mut req = client
            .post(&url)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);
        if let Some(ref key) = self.api_key {
            req = req.header("x-api-key", key.as_str());
        }

        let resp = req.send().await?;
        let status = resp.status().as_u16();

        if !resp.status().is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(Self::parse_retry_after);
            let text = resp.text().await.unwrap_or_default();
            if status == 401 || status == 403 {
                return Err(RlmError::Auth(text));
            }
            return Err(RlmError::Http {
                status,
                body: text,
                retry_after,
            });
        }

        let json_resp: Value = resp.json().await?;
        let text = json_resp["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        let stop_reason = json_resp["stop_reason"].as_str().map(str::to_string);
        let usage = Usage {
            input_tokens: json_resp["usage"]["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: json_resp["usage"]["output_tokens"].as_u64().unwrap_or(0),
            cache_read: json_resp["usage"]["cache_read_input_tokens"].as_u64(),
            cache_write: json_resp["usage"]["cache_creation_input_tokens"].as_u64(),
        };

        Ok(Completion {
            text,
            usage,
            stop_reason,
        })
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }
}
