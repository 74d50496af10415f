//! Mock backend for testing without a live LM provider.
//!
//! [`MockBackend`] returns pre-configured responses in order, with optional
//! per-response delays for exercising concurrency and ordering, and
//! synthesizes plausible token usage so accounting paths stay covered.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use super::{Backend, Completion};
use crate::error::Result;
use crate::protocol::{LmRequest, Usage};

/// A test backend that returns canned responses in order.
///
/// Cycles back to the beginning when all responses have been consumed.
/// Usage is synthesized from message and response lengths (~4 chars per
/// token) so budget and accounting logic sees non-zero numbers.
#[derive(Debug)]
pub struct MockBackend {
    responses: Vec<String>,
    delays: Vec<Duration>,
    index: AtomicUsize,
}

impl MockBackend {
    /// Create a mock backend with the given canned responses.
    pub fn new(responses: Vec<String>) -> Self {
        assert!(
            !responses.is_empty(),
            "MockBackend requires at least one response"
        );
        Self {
            responses,
            delays: Vec::new(),
            index: AtomicUsize::new(0),
        }
    }

    /// Create a mock that always returns the same response.
    pub fn fixed(response: impl Into<String>) -> Self {
        Self::new(vec![response.into()])
    }

    /// Delay the i-th call by `delays[i]` (cycling like responses). Used to
    /// test that concurrent fan-out preserves input order under skew.
    pub fn with_delays(mut self, delays: Vec<Duration>) -> Self {
        self.delays = delays;
        self
    }

    fn next_index(&self) -> usize {
        self.index.fetch_add(1, Ordering::Relaxed)
    }

    fn estimate_tokens(text: &str) -> u64 {
        (text.len() as u64 / 4).max(1)
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn complete(
        &self,
        _client: &Client,
        _base_url: &str,
        request: &LmRequest,
    ) -> Result<Completion> {
        let idx = self.next_index();
        if !self.delays.is_empty() {
            tokio::time::sleep(self.delays[idx % self.delays.len()]).await;
        }
        let text = self.responses[idx % self.responses.len()].clone();

        let input: u64 = request
            .messages
            .iter()
            .map(|m| Self::estimate_tokens(&m.content))
            .sum();
        Ok(Completion {
            usage: Usage {
                input_tokens: input,
                output_tokens: Self::estimate_tokens(&text),
                cache_read: None,
                cache_write: None,
            },
            stop_reason: Some("end_turn".into()),
            text,
        })
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
