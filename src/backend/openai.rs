//! Backend for OpenAI-compatible chat completion APIs.
//!
//! [`OpenAiBackend`] covers OpenAI itself plus the many providers that speak
//! the same `/v1/chat/completions` dialect (vLLM, Together, Groq, Mistral,
//! Fireworks, llama.cpp server, Ollama's `/v1/` endpoint).

use super::{Backend, Completion};
use crate::error::{Result, RlmError};
use crate::protocol::{LmRequest, Role, Usage};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

/// Backend for any OpenAI-compatible API.
///
/// # Example
///
/// ```
/// use rlm_runtime::backend::OpenAiBackend;
///
/// let backend = OpenAiBackend::new();
/// let with_key = OpenAiBackend::new().with_api_key("sk-...");
/// ```
#[derive(Clone, Default)]
pub struct OpenAiBackend {
    /// Optional API key, sent as `Authorization: Bearer {key}`.
    api_key: Option<String>,
    /// Optional organization id, sent as `OpenAI-Organization: {org}`.
    organization: Option<String>,
}

impl std::fmt::Debug for OpenAiBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiBackend")
            .field(
                "api_key",
                &self.api_key.as_ref().map(|k| {
                    if k.len() > 6 {
                        format!("{}***", &k[..6])
                    } else {
                        "***".to_string()
                    }
                }),
            )
            .field("organization", &self.organization)
            .finish()
    }
}

impl OpenAiBackend {
    /// Create a backend without authentication.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend keyed from the `OPENAI_API_KEY` environment
    /// variable, unauthenticated if unset.
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            organization: None,
        }
    }

    /// Set the API key for authentication.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the organization id header.
    pub fn with_organization(mut self, org: impl Into<String>) -> Self {
        self.organization = Some(org.into());
        self
    }

    fn build_body(request: &LmRequest, model: &str) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                json!({"role": role, "content": m.content})
            })
            .collect();

        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": false,
        });
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(m) = request.max_tokens {
            body["max_tokens"] = json!(m);
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
impl Backend for OpenAiBackend {
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
        let url = format!("{}/v1/chat/completions", base_url.trim_end_matches('/'));
        let body = Self::build_body(request, model);

        let mut req = client.post(&url).json(&body);
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }
        if let Some(ref org) = self.organization {
            req = req.header("OpenAI-Organization", org.as_str());
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
        let text = json_resp["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();
        let stop_reason = json_resp["choices"][0]["finish_reason"]
            .as_str()
            .map(str::to_string);
        let usage = Usage {
            input_tokens: json_resp["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: json_resp["usage"]["completion_tokens"]
                .as_u64()
                .unwrap_or(0),
            cache_read: json_resp["usage"]["prompt_tokens_details"]["cached_tokens"].as_u64(),
            cache_write: None,
        };

        Ok(Completion {
            text,
            usage,
            stop_reason,
        })
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_body_includes_messages_in_order() {
        let req = LmRequest::from_prompt("s", "hello", 0)
            .with_messages(vec![
                crate::protocol::ChatMessage::system("be terse"),
                crate::protocol::ChatMessage::user("hello"),
            ]);
        let body = OpenAiBackend::build_body(&req, "gpt-test");
        assert_eq!(body["model"], "gpt-test");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hello");
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn test_build_body_optional_params() {
        let mut req = LmRequest::from_prompt("s", "x", 0);
        req.temperature = Some(0.2);
        req.max_tokens = Some(256);
        let body = OpenAiBackend::build_body(&req, "m");
        assert_eq!(body["temperature"], 0.2);
        assert_eq!(body["max_tokens"], 256);
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(
            OpenAiBackend::parse_retry_after("30"),
            Some(std::time::Duration::from_secs(30))
        );
        assert_eq!(OpenAiBackend::parse_retry_after("soon"), None);
    }

    #[test]
    fn test_debug_redacts_key() {
        let backend = OpenAiBackend::new().with_api_key("sk-secret-key-123");
        let debug = format!("{:?}", backend);
        assert!(!debug.contains("secret-key"));
    }
}
