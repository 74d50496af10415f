use std::time::Duration;
use thiserror::Error;

/// Errors produced by the substrate and its components.
#[derive(Error, Debug)]
pub enum RlmError {
    /// Low-level HTTP transport failure (connection refused, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Socket-level I/O failure on the framed TCP path.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failed at the serde level.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// A malformed frame or message on the wire: short read, oversized
    /// length prefix, or non-UTF-8 payload. Never retried.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// HTTP error with status code, response body, and optional Retry-After
    /// hint, returned by [`Backend`](crate::backend::Backend)
    /// implementations on non-success status codes.
    #[error("HTTP {status}: {body}")]
    Http {
        /// HTTP status code (e.g. 429, 500, 503).
        status: u16,
        /// Response body text.
        body: String,
        /// Parsed `Retry-After` header value, if present.
        retry_after: Option<Duration>,
    },

    /// Authentication or authorization rejected by the provider. Fatal --
    /// retrying cannot help.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A sub-LM request exceeded the configured recursion depth.
    #[error("depth {depth} exceeds max depth {max_depth}")]
    DepthExceeded { depth: u32, max_depth: u32 },

    /// An operation exceeded its deadline.
    #[error("{what} timed out after {after:?}")]
    Timeout { what: String, after: Duration },

    /// Provider-level sandbox failure: provisioning, tunnel, or driver.
    #[error("sandbox error: {0}")]
    Sandbox(String),

    /// User code raised inside the sandbox. Recorded in the iteration,
    /// never fatal to the session on its own.
    #[error("execution error: {0}")]
    Execution(String),

    /// A session budget (tokens or iterations) was exhausted.
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    /// The session or operation was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// Invalid configuration detected at build time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl RlmError {
    /// The wire-level error code carried in `LmResponse.error` and surfaced
    /// to sandbox code as the `llm_query` sentinel.
    pub fn wire_code(&self) -> &'static str {
        match self {
            RlmError::Request(_) | RlmError::Io(_) => "transport",
            RlmError::Json(_) | RlmError::Protocol(_) => "protocol",
            RlmError::Http { status: 429, .. } => "rate_limited",
            RlmError::Http { .. } => "http",
            RlmError::Auth(_) => "auth",
            RlmError::DepthExceeded { .. } => "depth_exceeded",
            RlmError::Timeout { .. } => "timeout",
            RlmError::Sandbox(_) => "sandbox",
            RlmError::Execution(_) => "execution",
            RlmError::BudgetExceeded(_) => "budget_exceeded",
            RlmError::Cancelled => "cancelled",
            RlmError::InvalidConfig(_) => "config",
            RlmError::Other(_) => "error",
        }
    }
}

impl From<anyhow::Error> for RlmError {
    fn from(err: anyhow::Error) -> Self {
        RlmError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RlmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_code_mapping() {
        assert_eq!(
            RlmError::DepthExceeded {
                depth: 3,
                max_depth: 2
            }
            .wire_code(),
            "depth_exceeded"
        );
        assert_eq!(
            RlmError::Timeout {
                what: "enqueue".into(),
                after: Duration::from_secs(1)
            }
            .wire_code(),
            "timeout"
        );
        assert_eq!(RlmError::Cancelled.wire_code(), "cancelled");
        assert_eq!(
            RlmError::Http {
                status: 429,
                body: String::new(),
                retry_after: None
            }
            .wire_code(),
            "rate_limited"
        );
    }

    #[test]
    fn test_anyhow_interop() {
        let err: RlmError = anyhow::anyhow!("driver exited").into();
        assert!(matches!(err, RlmError::Other(_)));
    }
}
