//! The sandbox broker: an HTTP request queue with blocking rendezvous.
//!
//! Runs *inside* an isolated sandbox, where the host cannot open connections
//! inward. Control is inverted: sandbox code POSTs `/enqueue` and blocks;
//! the host polls `/pending`, services each request against the LM Handler,
//! and POSTs the result to `/respond`, which wakes the matching waiter.
//!
//! | Endpoint   | Method | Semantics |
//! |------------|--------|-----------|
//! | `/enqueue` | POST   | Park the caller until `/respond` arrives or the enqueue timeout elapses |
//! | `/pending` | GET    | Drain unclaimed requests, FIFO by arrival |
//! | `/respond` | POST   | Deliver a response to the waiter; 404 when no such pending |
//! | `/health`  | GET    | Liveness probe |
//!
//! `/pending` is idempotent across poller restarts: a returned request is
//! marked claimed and not returned again, unless the poller posts a failure
//! response -- then it is re-enqueued once, after which the failure is
//! delivered.

use crate::error::Result;
use crate::protocol::{LmRequest, LmResponse};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct PendingRecord {
    seq: u64,
    request: LmRequest,
    notifier: Option<oneshot::Sender<LmResponse>>,
    claimed: bool,
    retried: bool,
}

/// Shared state behind the broker endpoints.
///
/// The pending map is mutated under a single mutex; wake-up goes through a
/// per-record one-shot channel, so no lock is held while a waiter parks.
pub struct BrokerState {
    pending: Mutex<HashMap<Uuid, PendingRecord>>,
    seq: AtomicU64,
    enqueue_timeout: Duration,
}

impl BrokerState {
    pub fn new(enqueue_timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            enqueue_timeout,
        }
    }

    /// Number of requests currently pending (claimed or not).
    pub fn pending_len(&self) -> usize {
        self.pending.lock().expect("pending map poisoned").len()
    }

    /// Deliver a synthetic `error=cancelled` response to every waiter and
    /// clear the map.
    pub fn cancel_all(&self) {
        let drained: Vec<PendingRecord> = {
            let mut map = self.pending.lock().expect("pending map poisoned");
            map.drain().map(|(_, rec)| rec).collect()
        };
        for mut rec in drained {
            if let Some(tx) = rec.notifier.take() {
                let _ = tx.send(LmResponse::err(rec.request.request_id, "cancelled"));
            }
        }
    }

    fn register(&self, request: LmRequest) -> oneshot::Receiver<LmResponse> {
        let (tx, rx) = oneshot::channel();
        let record = PendingRecord {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            request,
            notifier: Some(tx),
            claimed: false,
            retried: false,
        };
        let mut map = self.pending.lock().expect("pending map poisoned");
        map.insert(record.request.request_id, record);
        rx
    }
}

/// Body of a `/respond` POST.
#[derive(Debug, Serialize, Deserialize)]
pub struct RespondBody {
    pub request_id: Uuid,
    pub response: LmResponse,
}

/// Build the axum router over shared broker state.
pub fn app(state: Arc<BrokerState>) -> Router {
    Router::new()
        .route("/enqueue", post(enqueue))
        .route("/pending", get(pending))
        .route("/respond", post(respond))
        .route("/health", get(health))
        .with_state(state)
}

async fn enqueue(
    State(state): State<Arc<BrokerState>>,
    Json(request): Json<LmRequest>,
) -> Json<LmResponse> {
    let request_id = request.request_id;
    debug!(%request_id, depth = request.depth, "enqueue");
    let rx = state.register(request);

    match tokio::time::timeout(state.enqueue_timeout, rx).await {
        Ok(Ok(response)) => Json(response),
        // Sender dropped without a send: treat as cancellation.
        Ok(Err(_)) => Json(LmResponse::err(request_id, "cancelled")),
        Err(_) => {
            // Timed out. Remove the record -- unless a response won the race,
            // in which case the map no longer holds it and the response is
            // already on the (now dropped) channel; the caller still gets
            // the timeout, which is the contract once the deadline passed.
            let mut map = state.pending.lock().expect("pending map poisoned");
            map.remove(&request_id);
            warn!(%request_id, "enqueue timed out");
            Json(LmResponse::err(request_id, "timeout"))
        }
    }
}

async fn pending(State(state): State<Arc<BrokerState>>) -> Json<Vec<LmRequest>> {
    let mut map = state.pending.lock().expect("pending map poisoned");
    let mut unclaimed: Vec<&mut PendingRecord> =
        map.values_mut().filter(|rec| !rec.claimed).collect();
    unclaimed.sort_by_key(|rec| rec.seq);

    let batch: Vec<LmRequest> = unclaimed
        .into_iter()
        .map(|rec| {
            rec.claimed = true;
            rec.request.clone()
        })
        .collect();
    Json(batch)
}

async fn respond(State(state): State<Arc<BrokerState>>, Json(body): Json<RespondBody>) -> Response {
    let notifier = {
        let mut map = state.pending.lock().expect("pending map poisoned");
        let Some(record) = map.get_mut(&body.request_id) else {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "no such pending request"})),
            )
                .into_response();
        };

        if body.response.is_err() && !record.retried {
            // First failure: put the request back for one more poll cycle.
            record.claimed = false;
            record.retried = true;
            debug!(request_id = %body.request_id, "failure response, re-enqueueing once");
            return Json(json!({"ok": true, "requeued": true})).into_response();
        }

        let mut record = map.remove(&body.request_id).expect("record present");
        record.notifier.take()
    };

    match notifier {
        Some(tx) => {
            // The waiter may have timed out and dropped its receiver.
            let delivered = tx.send(body.response).is_ok();
            Json(json!({"ok": delivered})).into_response()
        }
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "pending record had no notifier"})),
        )
            .into_response(),
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

/// A broker bound to a local port and serving in the background.
pub struct Broker {
    addr: SocketAddr,
    state: Arc<BrokerState>,
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl Broker {
    /// Bind and serve. `addr` is usually `127.0.0.1:0` in-process, or
    /// `0.0.0.0:<well-known port>` inside a sandbox.
    pub async fn serve(addr: &str, enqueue_timeout: Duration) -> Result<Self> {
        let state = Arc::new(BrokerState::new(enqueue_timeout));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "broker listening");

        let shutdown = CancellationToken::new();
        let server = axum::serve(listener, app(Arc::clone(&state)))
            .with_graceful_shutdown(shutdown.clone().cancelled_owned());
        let task = tokio::spawn(async move {
            if let Err(e) = server.await {
                warn!(error = %e, "broker server exited with error");
            }
        });

        Ok(Self {
            addr: local_addr,
            state,
            shutdown,
            task,
        })
    }

    /// Base URL of the broker as reachable on this host.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn state(&self) -> Arc<BrokerState> {
        Arc::clone(&self.state)
    }

    /// Cancel all waiters and shut the server down.
    pub async fn stop(self) {
        self.state.cancel_all();
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}
