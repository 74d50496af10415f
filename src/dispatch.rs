//! The recursive-call dispatcher: `llm_query` from inside the sandbox.
//!
//! Sandbox code runs synchronously (the namespace engine is not async), so
//! both transports here block: [`TcpTransport`] speaks one framed
//! request/response pair over `std::net` to the LM Handler (non-isolated
//! environments), and [`BrokerTransport`] POSTs to the local broker's
//! `/enqueue` and parks on the HTTP response (isolated environments).
//!
//! Errors never unwind into user code. A failed call returns the documented
//! sentinel string `"[error] <code>"` -- e.g. a call past the depth cap
//! evaluates to `"[error] depth_exceeded"` -- so a code block that mishandles
//! a failure still completes and the outer LM sees the evidence.

use crate::error::Result;
use crate::protocol::{
    read_frame_sync, write_frame_sync, LmRequest, LmResponse, Usage, DEFAULT_MAX_FRAME_BYTES,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// One sub-LM call as observed by the dispatcher, drained into the
/// iteration record after each code block.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SubCallRecord {
    pub request_id: Uuid,
    pub depth: u32,
    pub usage: Usage,
}

/// Blocking transport carrying one LM request to wherever it gets serviced.
pub trait SubCallTransport: Send + Sync {
    fn call(&self, request: &LmRequest) -> Result<LmResponse>;
}

/// Direct framed TCP to the LM Handler. Used by non-isolated environments.
pub struct TcpTransport {
    addr: SocketAddr,
    connect_timeout: Duration,
    max_frame: usize,
}

impl TcpTransport {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(5),
            max_frame: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl SubCallTransport for TcpTransport {
    fn call(&self, request: &LmRequest) -> Result<LmResponse> {
        let mut stream = std::net::TcpStream::connect_timeout(&self.addr, self.connect_timeout)?;
        write_frame_sync(&mut stream, request)?;
        read_frame_sync(&mut stream, self.max_frame)
    }
}

/// POST to the local broker's `/enqueue`, blocking until the host services
/// the request. Used by drivers inside isolated sandboxes.
///
/// The HTTP client is created lazily on the first call -- construction may
/// happen on an async runtime thread, where building a blocking client is
/// not allowed, but `call` always runs on a plain worker thread.
pub struct BrokerTransport {
    enqueue_url: String,
    wait_timeout: Duration,
    client: OnceLock<reqwest::blocking::Client>,
}

impl BrokerTransport {
    /// `broker_url` is the broker base URL; `wait_timeout` should exceed the
    /// broker's enqueue timeout so the synthetic timeout response arrives
    /// before the HTTP client gives up.
    pub fn new(broker_url: impl Into<String>, wait_timeout: Duration) -> Self {
        Self {
            enqueue_url: format!("{}/enqueue", broker_url.into().trim_end_matches('/')),
            wait_timeout,
            client: OnceLock::new(),
        }
    }

    fn client(&self) -> &reqwest::blocking::Client {
        self.client.get_or_init(|| {
            reqwest::blocking::Client::builder()
                .timeout(self.wait_timeout + Duration::from_secs(30))
                .build()
                .expect("failed to build blocking HTTP client")
        })
    }
}

impl SubCallTransport for BrokerTransport {
    fn call(&self, request: &LmRequest) -> Result<LmResponse> {
        let resp = self
            .client()
            .post(&self.enqueue_url)
            .json(request)
            .send()?
            .error_for_status()?;
        Ok(resp.json()?)
    }
}

fn error_sentinel(code: &str) -> String {
    format!("[error] {}", code)
}

/// Builds and routes sub-LM calls on behalf of executing sandbox code.
///
/// Each call is stamped with the owning session id and `depth = parent + 1`,
/// gets a fresh request UUID, and is logged for the iteration record.
pub struct Dispatcher {
    transport: Arc<dyn SubCallTransport>,
    session_id: String,
    depth: u32,
    fanout: usize,
    calls: Mutex<Vec<SubCallRecord>>,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn SubCallTransport>,
        session_id: impl Into<String>,
        depth: u32,
    ) -> Self {
        Self {
            transport,
            session_id: session_id.into(),
            depth,
            fanout: 8,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Bound the concurrent fan-out of `llm_query_batched`. Default: 8.
    pub fn with_fanout(mut self, fanout: usize) -> Self {
        assert!(fanout > 0, "fanout must be nonzero");
        self.fanout = fanout;
        self
    }

    fn build_request(&self, prompt: &str, model: Option<&str>) -> LmRequest {
        let mut request = LmRequest::from_prompt(&self.session_id, prompt, self.depth + 1);
        if let Some(model) = model {
            request = request.with_model(model);
        }
        request
    }

    fn record(&self, request_id: Uuid, usage: Usage) {
        self.calls
            .lock()
            .expect("sub-call log poisoned")
            .push(SubCallRecord {
                request_id,
                depth: self.depth + 1,
                usage,
            });
    }

    /// One sub-LM call. Returns the response content, or the error sentinel.
    pub fn llm_query(&self, prompt: &str, model: Option<&str>) -> String {
        let request = self.build_request(prompt, model);
        let request_id = request.request_id;
        debug!(%request_id, depth = request.depth, "llm_query");

        match self.transport.call(&request) {
            Ok(response) => {
                self.record(request_id, response.usage);
                match response.content {
                    Some(content) => content,
                    None => error_sentinel(response.error.as_deref().unwrap_or("error")),
                }
            }
            Err(e) => {
                self.record(request_id, Usage::default());
                error_sentinel(e.wire_code())
            }
        }
    }

    /// Issue all prompts concurrently (bounded fan-out) and return results
    /// in input order. Per-item failures surface as sentinels without
    /// failing the batch.
    pub fn llm_query_batched(&self, prompts: &[String], model: Option<&str>) -> Vec<String> {
        if prompts.is_empty() {
            return Vec::new();
        }

        let slots: Vec<Mutex<Option<String>>> =
            prompts.iter().map(|_| Mutex::new(None)).collect();
        let next = AtomicUsize::new(0);
        let workers = self.fanout.min(prompts.len());

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let i = next.fetch_add(1, Ordering::Relaxed);
                    if i >= prompts.len() {
                        break;
                    }
                    let result = self.llm_query(&prompts[i], model);
                    *slots[i].lock().expect("batch slot poisoned") = Some(result);
                });
            }
        });

        slots
            .into_iter()
            .map(|slot| {
                slot.into_inner()
                    .expect("batch slot poisoned")
                    .expect("every slot filled by a worker")
            })
            .collect()
    }

    /// Drain the sub-call log accumulated since the last drain.
    pub fn take_sub_calls(&self) -> Vec<SubCallRecord> {
        std::mem::take(&mut *self.calls.lock().expect("sub-call log poisoned"))
    }
}

/// A transport that answers from a closure, for tests and dry runs.
pub struct FnTransport<F>(pub F);

impl<F> SubCallTransport for FnTransport<F>
where
    F: Fn(&LmRequest) -> Result<LmResponse> + Send + Sync,
{
    fn call(&self, request: &LmRequest) -> Result<LmResponse> {
        (self.0)(request)
    }
}
