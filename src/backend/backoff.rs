//! Transport-level retry with exponential backoff and jitter.
//!
//! [`BackoffConfig`] controls how transient errors (429, 5xx, connection
//! resets, timeouts) are retried with increasing delays. The default is
//! [`BackoffConfig::standard()`] -- three retries with full jitter -- which
//! suits cloud providers; use [`BackoffConfig::none()`] for tests or local
//! inference servers.

use std::time::Duration;

/// Configuration for transport-level retry.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Maximum number of transport retries. Default: 3.
    pub max_retries: u32,

    /// Delay before the first retry. Default: 1 second.
    pub initial_delay: Duration,

    /// Multiplier applied per retry: initial, initial*m, initial*m^2, …
    /// Default: 2.0.
    pub multiplier: f64,

    /// Ceiling on the computed delay. Default: 60 seconds.
    pub max_delay: Duration,

    /// Jitter strategy. Default: Full.
    pub jitter: JitterStrategy,

    /// HTTP status codes that trigger retry. Default: `[429, 500, 502, 503, 504]`.
    pub retryable_statuses: Vec<u16>,

    /// Honor the provider's `Retry-After` hint when present. Default: true.
    pub respect_retry_after: bool,
}

/// Jitter applied to computed delays, spreading retries from concurrent
/// sandboxes that hit the same rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterStrategy {
    /// Delay is exactly the computed value.
    None,
    /// Random value in `[0, computed_delay]`.
    Full,
    /// `computed_delay/2 + random in [0, computed_delay/2]`.
    Equal,
}

impl BackoffConfig {
    /// No transport retry.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::standard()
        }
    }

    /// Defaults for cloud providers: 3 retries, 1 s initial, 2x multiplier,
    /// 60 s cap, full jitter, honors Retry-After.
    pub fn standard() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: JitterStrategy::Full,
            retryable_statuses: vec![429, 500, 502, 503, 504],
            respect_retry_after: true,
        }
    }

    /// Delay for attempt N (0-indexed): `initial * multiplier^N`, capped at
    /// `max_delay`, with jitter applied.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        let jittered = match self.jitter {
            JitterStrategy::None => capped,
            JitterStrategy::Full => fastrand::f64() * capped,
            JitterStrategy::Equal => capped / 2.0 + fastrand::f64() * (capped / 2.0),
        };

        Duration::from_secs_f64(jittered)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::standard()
    }
}
