//! The LM capability: one handle over any backend.
//!
//! [`LmClient`] owns the HTTP client, backend, retry policy, and usage
//! accounting. It is constructed once and shared (it is the explicit handle
//! that stands in for a process-global client -- sessions receive it by
//! `Arc`). All completions funnel through here, so usage counters never
//! miss a call: accounting is updated before the result is returned.

use crate::backend::{with_backoff, Backend, BackoffConfig, Completion, OpenAiBackend};
use crate::error::{Result, RlmError};
use crate::protocol::LmRequest;
use crate::usage::{UsageSummary, UsageTracker};
use reqwest::Client;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

/// Shared LM capability handle.
///
/// # Example
///
/// ```no_run
/// use rlm_runtime::client::LmClient;
/// use rlm_runtime::protocol::LmRequest;
///
/// # async fn demo() -> rlm_runtime::error::Result<()> {
/// let lm = LmClient::builder("https://api.openai.com").build();
/// let request = LmRequest::from_prompt("sess", "hello", 0).with_model("gpt-4o-mini");
/// let completion = lm.acompletion(&request).await?;
/// println!("{}", completion.text);
/// # Ok(())
/// # }
/// ```
pub struct LmClient {
    http: Client,
    base_url: String,
    backend: Arc<dyn Backend>,
    backoff: BackoffConfig,
    call_timeout: Duration,
    usage: UsageTracker,
    cancellation: Option<Arc<AtomicBool>>,
}

impl LmClient {
    /// Create a new builder.
    pub fn builder(base_url: impl Into<String>) -> LmClientBuilder {
        LmClientBuilder {
            http: None,
            base_url: base_url.into(),
            backend: None,
            backoff: None,
            call_timeout: None,
            cancellation: None,
        }
    }

    /// Backend name, for logging.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Execute one completion asynchronously, with retry and a per-call
    /// timeout. Usage is recorded under `request.depth` before returning.
    pub async fn acompletion(&self, request: &LmRequest) -> Result<Completion> {
        let fut = with_backoff(
            &self.backend,
            &self.http,
            &self.base_url,
            request,
            &self.backoff,
            self.cancellation.as_deref(),
            None,
        );
        let completion = match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(RlmError::Timeout {
                    what: format!("LM call {}", request.request_id),
                    after: self.call_timeout,
                })
            }
        };
        self.usage.record(request.depth, &completion.usage);
        Ok(completion)
    }

    /// Blocking variant of [`acompletion`](Self::acompletion).
    ///
    /// Requires a multi-thread tokio runtime; panics on a current-thread
    /// runtime. Sandbox-side callers normally go through the dispatcher
    /// instead, which has its own blocking transports.
    pub fn completion(&self, request: &LmRequest) -> Result<Completion> {
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(self.acompletion(request))
        })
    }

    /// Snapshot of accumulated usage across all calls.
    pub fn usage_summary(&self) -> UsageSummary {
        self.usage.summary()
    }

    /// Snapshot of accumulated usage keyed by recursion depth.
    pub fn usage_by_depth(&self) -> BTreeMap<u32, UsageSummary> {
        self.usage.by_depth()
    }
}

impl std::fmt::Debug for LmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmClient")
            .field("base_url", &self.base_url)
            .field("backend", &self.backend.name())
            .field("backoff", &self.backoff)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

/// Builder for [`LmClient`].
pub struct LmClientBuilder {
    http: Option<Client>,
    base_url: String,
    backend: Option<Arc<dyn Backend>>,
    backoff: Option<BackoffConfig>,
    call_timeout: Option<Duration>,
    cancellation: Option<Arc<AtomicBool>>,
}

impl LmClientBuilder {
    /// Set the HTTP client. If not set, a default client is created.
    pub fn http_client(mut self, client: Client) -> Self {
        self.http = Some(client);
        self
    }

    /// Set the LM backend. Default: [`OpenAiBackend::from_env`].
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set the transport retry configuration. Default: [`BackoffConfig::standard()`].
    pub fn backoff(mut self, config: BackoffConfig) -> Self {
        self.backoff = Some(config);
        self
    }

    /// Set the per-call timeout. Default: 120 seconds.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Set the cancellation flag checked between retry attempts.
    pub fn cancellation(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancellation = Some(cancel);
        self
    }

    /// Build the client.
    pub fn build(self) -> LmClient {
        LmClient {
            http: self.http.unwrap_or_default(),
            base_url: self.base_url.trim_end_matches('/').to_string(),
            backend: self
                .backend
                .unwrap_or_else(|| Arc::new(OpenAiBackend::from_env())),
            backoff: self.backoff.unwrap_or_default(),
            call_timeout: self.call_timeout.unwrap_or(Duration::from_secs(120)),
            usage: UsageTracker::new(),
            cancellation: self.cancellation,
        }
    }
}
