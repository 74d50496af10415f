//! The LM Handler: a concurrent TCP server servicing LM requests.
//!
//! Each accepted connection carries exactly one framed [`LmRequest`] and
//! receives exactly one framed [`LmResponse`]; there is no keep-alive. A
//! process-wide semaphore (default 64 permits) gates dispatch -- the permit
//! is taken *before* `accept`, so excess connections queue in the OS accept
//! queue in arrival order.
//!
//! Failure semantics:
//! - backend error: response with `error` populated, connection closes
//!   normally;
//! - protocol error: connection dropped, nothing written;
//! - shutdown: the listener closes, in-flight workers drain within a grace
//!   period, stragglers are cut loose at their next suspension point.

use crate::client::LmClient;
use crate::config::RlmConfig;
use crate::protocol::{self, LmRequest, LmResponse, DEFAULT_MAX_FRAME_BYTES};
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Maps recursion depth to the model serving it.
///
/// Exact matches win; unknown depths fall back to the model of the highest
/// configured depth.
#[derive(Debug, Clone)]
pub struct DepthRouter {
    models: BTreeMap<u32, String>,
}

impl DepthRouter {
    pub fn new(models: BTreeMap<u32, String>) -> Self {
        assert!(!models.is_empty(), "DepthRouter requires at least one model");
        Self { models }
    }

    pub fn from_config(config: &RlmConfig) -> Self {
        Self::new(config.effective_depth_models())
    }

    /// The model for a given depth.
    pub fn resolve(&self, depth: u32) -> &str {
        self.models
            .get(&depth)
            .or_else(|| self.models.values().next_back())
            .expect("router has at least one model")
    }
}

/// Tuning for [`LmHandler`].
#[derive(Debug, Clone)]
pub struct HandlerOptions {
    /// Cap on concurrent LM dispatches. Default: 64.
    pub max_concurrent: usize,
    /// Requests deeper than this are rejected with `depth_exceeded`.
    pub max_depth: u32,
    /// Drain window for in-flight workers on `stop()`. Default: 5 s.
    pub grace: Duration,
    /// Frame size cap.
    pub max_frame: usize,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 64,
            max_depth: 2,
            grace: Duration::from_secs(5),
            max_frame: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl HandlerOptions {
    pub fn from_config(config: &RlmConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent_calls,
            max_depth: config.max_depth,
            ..Default::default()
        }
    }
}

struct Shared {
    lm: Arc<LmClient>,
    router: DepthRouter,
    options: HandlerOptions,
    cancelled_sessions: Mutex<HashSet<String>>,
    shutdown: CancellationToken,
}

/// A running LM Handler bound to a local address.
pub struct LmHandler {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    tracker: TaskTracker,
    accept_task: tokio::task::JoinHandle<()>,
}

impl LmHandler {
    /// Bind the listener and start accepting connections.
    pub async fn bind(
        addr: &str,
        lm: Arc<LmClient>,
        router: DepthRouter,
        options: HandlerOptions,
    ) -> crate::error::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "LM handler listening");

        let shared = Arc::new(Shared {
            lm,
            router,
            options,
            cancelled_sessions: Mutex::new(HashSet::new()),
            shutdown: CancellationToken::new(),
        });
        let tracker = TaskTracker::new();
        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&shared), tracker.clone()));

        Ok(Self {
            local_addr,
            shared,
            tracker,
            accept_task,
        })
    }

    /// The bound address; dispatchers and pollers connect here.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Drop all requests belonging to a cancelled session: in-flight and
    /// future requests for it get `error=cancelled` responses.
    pub fn cancel_session(&self, session_id: &str) {
        self.shared
            .cancelled_sessions
            .lock()
            .expect("session set poisoned")
            .insert(session_id.to_string());
    }

    /// Close the listener, drain in-flight workers within the grace period,
    /// then cut stragglers loose (they observe the cancelled token at their
    /// next suspension point).
    pub async fn stop(self) {
        self.shared.shutdown.cancel();
        self.accept_task.abort();
        self.tracker.close();
        if tokio::time::timeout(self.shared.options.grace, self.tracker.wait())
            .await
            .is_err()
        {
            warn!("handler stop: grace period elapsed with workers in flight");
        }
        info!("LM handler stopped");
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, tracker: TaskTracker) {
    let semaphore = Arc::new(Semaphore::new(shared.options.max_concurrent));
    loop {
        // Take the capacity permit first so excess connections wait in the
        // OS accept queue in arrival order.
        let permit = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };
        let stream = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "connection accepted");
                    stream
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };
        let shared = Arc::clone(&shared);
        tracker.spawn(async move {
            handle_connection(stream, shared).await;
            drop(permit);
        });
    }
}

/// Per-connection worker: read one frame, dispatch, write one frame, close.
async fn handle_connection(mut stream: TcpStream, shared: Arc<Shared>) {
    let request: LmRequest = match protocol::read_frame(&mut stream, shared.options.max_frame).await
    {
        Ok(request) => request,
        Err(e) => {
            // Malformed frame: drop the connection without a response.
            debug!(error = %e, "dropping connection on protocol error");
            return;
        }
    };

    let request_id = request.request_id;
    let response = service_request(request, &shared).await;
    if let Err(e) = protocol::write_frame(&mut stream, &response).await {
        warn!(%request_id, error = %e, "failed to write response frame");
    }
}

async fn service_request(request: LmRequest, shared: &Shared) -> LmResponse {
    let session_cancelled = shared
        .cancelled_sessions
        .lock()
        .expect("session set poisoned")
        .contains(&request.session_id);
    if session_cancelled {
        return LmResponse::err(request.request_id, "cancelled");
    }

    if request.depth > shared.options.max_depth {
        debug!(
            depth = request.depth,
            max_depth = shared.options.max_depth,
            "rejecting over-deep request"
        );
        return LmResponse::err(request.request_id, "depth_exceeded");
    }

    let mut routed = request;
    if routed.model.is_none() {
        routed.model = Some(shared.router.resolve(routed.depth).to_string());
    }

    let outcome = tokio::select! {
        _ = shared.shutdown.cancelled() => Err(crate::error::RlmError::Cancelled),
        result = shared.lm.acompletion(&routed) => result,
    };

    match outcome {
        Ok(completion) => LmResponse::ok(
            routed.request_id,
            completion.text,
            completion.usage,
            completion.stop_reason,
        ),
        Err(e) => {
            debug!(request_id = %routed.request_id, error = %e, "backend error");
            LmResponse::err(routed.request_id, e.wire_code())
        }
    }
}
