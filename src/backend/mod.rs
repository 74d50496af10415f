//! Backend trait and transport-level retry.
//!
//! The [`Backend`] trait abstracts over LM providers, translating the
//! normalized [`LmRequest`](crate::protocol::LmRequest) into the provider's
//! HTTP API and returning a [`Completion`]. Built-in implementations:
//! [`OpenAiBackend`], [`AnthropicBackend`], [`MockBackend`].
//!
//! ```text
//! LmClient ──► LmRequest ──► Backend::complete() ──► Completion
//!                                    │
//!                       ┌────────────┼────────────┐
//!                OpenAiBackend  AnthropicBackend  MockBackend
//!               /v1/chat/...      /v1/messages     canned
//! ```

pub mod anthropic;
pub mod backoff;
pub mod mock;
pub mod openai;

pub use anthropic::AnthropicBackend;
pub use backoff::BackoffConfig;
pub use mock::MockBackend;
pub use openai::OpenAiBackend;

use crate::error::{Result, RlmError};
use crate::protocol::{LmRequest, Usage};
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;

/// Callback invoked before each transport retry:
/// `(attempt_number, delay_before_retry, reason_for_retry)`.
pub type RetryCallback<'a> = Option<&'a mut (dyn FnMut(u32, std::time::Duration, &str) + Send)>;

/// The normalized result of one backend call.
#[derive(Debug, Clone)]
pub struct Completion {
    /// The generated text content.
    pub text: String,
    /// Token accounting reported by the provider (zeroed if absent).
    pub usage: Usage,
    /// Provider stop reason, when reported.
    pub stop_reason: Option<String>,
}

/// Abstraction over LM providers.
///
/// Implementors translate the normalized request into the provider's HTTP
/// API. The model to use is `request.model` -- the handler's depth routing
/// fills it in before dispatch; backends treat an unset model as a
/// configuration error.
///
/// Object-safe; used as `Arc<dyn Backend>` and shared across connections,
/// so implementations must be concurrency-safe.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Execute one non-streaming LM call.
    async fn complete(
        &self,
        client: &Client,
        base_url: &str,
        request: &LmRequest,
    ) -> Result<Completion>;

    /// Human-readable name for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Check whether an error is retryable under the backoff config.
///
/// Retryable: HTTP statuses in `config.retryable_statuses` (429, 5xx by
/// default), connection/transport failures, socket I/O failures, and
/// timeouts. Auth failures and other 4xx are fatal.
pub fn is_retryable(error: &RlmError, config: &BackoffConfig) -> bool {
    match error {
        RlmError::Http { status, .. } => config.retryable_statuses.contains(status),
        RlmError::Request(_) | RlmError::Io(_) => true,
        RlmError::Timeout { .. } => true,
        _ => false,
    }
}

/// Execute a backend call with transport-level retry and exponential backoff.
///
/// Retries transient failures up to `config.max_retries` times, sleeping
/// between attempts per [`BackoffConfig::delay_for_attempt`]. A `Retry-After`
/// hint on a rate-limit response overrides the computed delay when
/// `config.respect_retry_after` is set. Returns the first success or the
/// last error once retries are exhausted; fatal errors return immediately.
pub async fn with_backoff(
    backend: &Arc<dyn Backend>,
    client: &Client,
    base_url: &str,
    request: &LmRequest,
    config: &BackoffConfig,
    cancel: Option<&std::sync::atomic::AtomicBool>,
    mut on_retry: RetryCallback<'_>,
) -> Result<Completion> {
    let mut last_error: Option<RlmError> = None;

    for attempt in 0..=config.max_retries {
        if let Some(flag) = cancel {
            if flag.load(std::sync::atomic::Ordering::Relaxed) {
                return Err(RlmError::Cancelled);
            }
        }

        if attempt > 0 {
            let delay = match &last_error {
                Some(RlmError::Http {
                    retry_after: Some(hint),
                    ..
                }) if config.respect_retry_after => *hint,
                _ => config.delay_for_attempt(attempt - 1),
            };

            let reason = last_error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_default();
            if let Some(ref mut cb) = on_retry {
                cb(attempt, delay, &reason);
            }

            tokio::time::sleep(delay).await;

            if let Some(flag) = cancel {
                if flag.load(std::sync::atomic::Ordering::Relaxed) {
                    return Err(RlmError::Cancelled);
                }
            }
        }

        match backend.complete(client, base_url, request).await {
            Ok(completion) => return Ok(completion),
            Err(e) => {
                if attempt < config.max_retries && is_retryable(&e, config) {
                    last_error = Some(e);
                    continue;
                }
                return Err(e);
            }
        }
    }

    Err(last_error.unwrap_or(RlmError::Other("backoff loop exited unexpectedly".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::LmRequest;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    #[test]
    fn test_is_retryable_429() {
        let config = BackoffConfig::standard();
        let err = RlmError::Http {
            status: 429,
            body: "rate limited".into(),
            retry_after: None,
        };
        assert!(is_retryable(&err, &config));
    }

    #[test]
    fn test_is_retryable_503() {
        let config = BackoffConfig::standard();
        let err = RlmError::Http {
            status: 503,
            body: "service unavailable".into(),
            retry_after: None,
        };
        assert!(is_retryable(&err, &config));
    }

    #[test]
    fn test_auth_is_fatal() {
        let config = BackoffConfig::standard();
        assert!(!is_retryable(&RlmError::Auth("bad key".into()), &config));
    }

    #[test]
    fn test_400_not_retried() {
        let config = BackoffConfig::standard();
        let err = RlmError::Http {
            status: 400,
            body: "bad request".into(),
            retry_after: None,
        };
        assert!(!is_retryable(&err, &config));
    }

    #[test]
    fn test_timeout_retryable() {
        let config = BackoffConfig::standard();
        let err = RlmError::Timeout {
            what: "lm call".into(),
            after: Duration::from_secs(120),
        };
        assert!(is_retryable(&err, &config));
    }

    /// A backend that fails with a retryable error a fixed number of times.
    struct FlakyBackend {
        failures: AtomicU32,
    }

    #[async_trait]
    impl Backend for FlakyBackend {
        async fn complete(
            &self,
            _client: &Client,
            _base_url: &str,
            request: &LmRequest,
        ) -> Result<Completion> {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    n.checked_sub(1)
                })
                .is_ok()
            {
                return Err(RlmError::Http {
                    status: 503,
                    body: "unavailable".into(),
                    retry_after: None,
                });
            }
            Ok(Completion {
                text: format!("echo:{}", request.messages[0].content),
                usage: Usage::default(),
                stop_reason: None,
            })
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_backoff_retries_until_success() {
        let backend: Arc<dyn Backend> = Arc::new(FlakyBackend {
            failures: AtomicU32::new(2),
        });
        let client = Client::new();
        let request = LmRequest::from_prompt("s", "hi", 0);
        let mut config = BackoffConfig::standard();
        config.initial_delay = Duration::from_millis(1);

        let mut retries = 0u32;
        let mut on_retry = |attempt: u32, _d: Duration, _r: &str| retries = attempt;
        let completion = with_backoff(
            &backend,
            &client,
            "http://unused",
            &request,
            &config,
            None,
            Some(&mut on_retry),
        )
        .await
        .unwrap();

        assert_eq!(completion.text, "echo:hi");
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn test_backoff_exhausts_and_surfaces_last_error() {
        let backend: Arc<dyn Backend> = Arc::new(FlakyBackend {
            failures: AtomicU32::new(10),
        });
        let client = Client::new();
        let request = LmRequest::from_prompt("s", "hi", 0);
        let mut config = BackoffConfig::standard();
        config.max_retries = 1;
        config.initial_delay = Duration::from_millis(1);

        let err = with_backoff(
            &backend,
            &client,
            "http://unused",
            &request,
            &config,
            None,
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RlmError::Http { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_backoff_respects_cancellation() {
        let cancel = AtomicBool::new(true);
        let backend: Arc<dyn Backend> = Arc::new(FlakyBackend {
            failures: AtomicU32::new(0),
        });
        let client = Client::new();
        let request = LmRequest::from_prompt("s", "hi", 0);

        let result = with_backoff(
            &backend,
            &client,
            "http://unused",
            &request,
            &BackoffConfig::standard(),
            Some(&cancel),
            None,
        )
        .await;
        assert!(matches!(result.unwrap_err(), RlmError::Cancelled));
    }
}
