//! Configuration for the execution substrate.
//!
//! [`RlmConfig`] gathers every knob a session needs: model routing, backend
//! and environment selection, budgets, and the timeout table. Plain struct
//! with `Default` + `with_*` builders; loading it from a file or CLI is the
//! embedder's job.

use crate::backend::{AnthropicBackend, Backend, MockBackend, OpenAiBackend};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// LM provider selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Any OpenAI-compatible chat completions API.
    #[default]
    OpenAi,
    /// Anthropic Messages API.
    Anthropic,
    /// Canned responses, for tests and dry runs.
    Mock,
}

impl BackendKind {
    /// Instantiate the backend, pulling credentials from the provider's
    /// environment variable. The mock yields an empty canned response;
    /// tests construct their own [`MockBackend`] with scripted output.
    pub fn instantiate(&self) -> Arc<dyn Backend> {
        match self {
            BackendKind::OpenAi => Arc::new(OpenAiBackend::from_env()),
            BackendKind::Anthropic => Arc::new(AnthropicBackend::from_env()),
            BackendKind::Mock => Arc::new(MockBackend::fixed("")),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::OpenAi => write!(f, "openai"),
            BackendKind::Anthropic => write!(f, "anthropic"),
            BackendKind::Mock => write!(f, "mock"),
        }
    }
}

/// Execution environment selection.
///
/// `Local` runs the sandbox namespace in-process. The remaining variants
/// name cloud/container providers whose bootstrap lives outside this crate;
/// each must supply a [`SandboxProvider`](crate::environment::SandboxProvider)
/// satisfying the broker contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentKind {
    #[default]
    Local,
    Modal,
    E2b,
    Prime,
    Daytona,
    Docker,
}

impl std::fmt::Display for EnvironmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EnvironmentKind::Local => "local",
            EnvironmentKind::Modal => "modal",
            EnvironmentKind::E2b => "e2b",
            EnvironmentKind::Prime => "prime",
            EnvironmentKind::Daytona => "daytona",
            EnvironmentKind::Docker => "docker",
        };
        write!(f, "{}", name)
    }
}

/// Main configuration for a substrate instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RlmConfig {
    /// Model used at depth 0 (the outer REPL's own calls).
    pub root_model: String,

    /// Default model at depth >= 1.
    pub sub_model: String,

    /// Explicit depth -> model map. When empty, `{0: root_model, 1:
    /// sub_model}` applies. Unknown depths fall back to the highest
    /// configured depth's model.
    #[serde(default)]
    pub depth_model_map: BTreeMap<u32, String>,

    /// Where code executes.
    #[serde(default)]
    pub environment_type: EnvironmentKind,

    /// LM provider.
    #[serde(default)]
    pub backend: BackendKind,

    /// Base URL for the provider API.
    pub base_url: String,

    /// Session iteration cap.
    pub max_iterations: u32,

    /// Recursive-call depth cap; the handler rejects deeper requests.
    pub max_depth: u32,

    /// Cumulative token budget per session. `None` = unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens_per_session: Option<u64>,

    /// Host poller period, milliseconds.
    pub polling_interval_ms: u64,

    /// Broker per-request wait, seconds.
    pub enqueue_timeout_s: u64,

    /// Per-code-block wall clock, seconds.
    pub block_timeout_s: u64,

    /// TCP connect timeout, seconds.
    pub connect_timeout_s: u64,

    /// Per-LM-call timeout, seconds.
    pub call_timeout_s: u64,

    /// Process-wide cap on concurrent LM calls in the handler.
    pub max_concurrent_calls: usize,

    /// Cap on in-flight request forwards per poller.
    pub poller_max_in_flight: usize,

    /// Bounded fan-out for `llm_query_batched`.
    pub batch_fanout: usize,

    /// Fence language tag marking executable code blocks.
    pub language_tag: String,
}

impl Default for RlmConfig {
    fn default() -> Self {
        Self {
            root_model: "gpt-4o".into(),
            sub_model: "gpt-4o-mini".into(),
            depth_model_map: BTreeMap::new(),
            environment_type: EnvironmentKind::Local,
            backend: BackendKind::OpenAi,
            base_url: "https://api.openai.com".into(),
            max_iterations: 20,
            max_depth: 2,
            max_tokens_per_session: None,
            polling_interval_ms: 100,
            enqueue_timeout_s: 600,
            block_timeout_s: 300,
            connect_timeout_s: 5,
            call_timeout_s: 120,
            max_concurrent_calls: 64,
            poller_max_in_flight: 16,
            batch_fanout: 8,
            language_tag: "rhai".into(),
        }
    }
}

impl RlmConfig {
    pub fn with_root_model(mut self, model: impl Into<String>) -> Self {
        self.root_model = model.into();
        self
    }

    pub fn with_sub_model(mut self, model: impl Into<String>) -> Self {
        self.sub_model = model.into();
        self
    }

    pub fn with_depth_model(mut self, depth: u32, model: impl Into<String>) -> Self {
        self.depth_model_map.insert(depth, model.into());
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_environment(mut self, kind: EnvironmentKind) -> Self {
        self.environment_type = kind;
        self
    }

    pub fn with_max_iterations(mut self, n: u32) -> Self {
        self.max_iterations = n;
        self
    }

    pub fn with_max_depth(mut self, n: u32) -> Self {
        self.max_depth = n;
        self
    }

    pub fn with_token_budget(mut self, tokens: u64) -> Self {
        self.max_tokens_per_session = Some(tokens);
        self
    }

    /// The depth -> model routing table with defaults applied.
    pub fn effective_depth_models(&self) -> BTreeMap<u32, String> {
        if self.depth_model_map.is_empty() {
            let mut map = BTreeMap::new();
            map.insert(0, self.root_model.clone());
            map.insert(1, self.sub_model.clone());
            map
        } else {
            self.depth_model_map.clone()
        }
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_secs(self.enqueue_timeout_s)
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_secs(self.block_timeout_s)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_s)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_s)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.root_model.is_empty() {
            return Err("root_model cannot be empty".into());
        }
        if self.sub_model.is_empty() && self.depth_model_map.is_empty() {
            return Err("sub_model cannot be empty without a depth_model_map".into());
        }
        if self.max_iterations == 0 {
            return Err("max_iterations must be at least 1".into());
        }
        if self.polling_interval_ms == 0 {
            return Err("polling_interval_ms must be nonzero".into());
        }
        if self.batch_fanout == 0 || self.max_concurrent_calls == 0 {
            return Err("concurrency caps must be nonzero".into());
        }
        if self.language_tag.is_empty() {
            return Err("language_tag cannot be empty".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        assert!(RlmConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = RlmConfig {
            max_iterations: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_depth_models_defaults() {
        let config = RlmConfig::default()
            .with_root_model("root")
            .with_sub_model("sub");
        let map = config.effective_depth_models();
        assert_eq!(map[&0], "root");
        assert_eq!(map[&1], "sub");
    }

    #[test]
    fn test_explicit_depth_map_wins() {
        let config = RlmConfig::default()
            .with_depth_model(0, "big")
            .with_depth_model(2, "small");
        let map = config.effective_depth_models();
        assert_eq!(map.len(), 2);
        assert_eq!(map[&2], "small");
    }

    #[test]
    fn test_serialization_round_trip() {
        let config = RlmConfig::default().with_token_budget(50_000);
        let json = serde_json::to_string(&config).unwrap();
        let back: RlmConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_tokens_per_session, Some(50_000));
        assert_eq!(back.backend, BackendKind::OpenAi);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(BackendKind::Anthropic.to_string(), "anthropic");
        assert_eq!(EnvironmentKind::E2b.to_string(), "e2b");
    }
}
