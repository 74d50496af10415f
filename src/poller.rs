//! The host poller: bridges a remote broker to the LM Handler.
//!
//! One poller task runs per active remote session. It drains the broker's
//! `/pending` queue on a fixed interval, forwards each request to the local
//! LM Handler over framed TCP, and posts the result back to `/respond`.
//! Forwarding failures are posted as error responses -- the request is never
//! re-issued to the backend from here. Three consecutive `/pending` failures
//! mark the session unhealthy and fire the linked cancellation token, which
//! the REPL loop observes.

use crate::broker::RespondBody;
use crate::protocol::{self, LmRequest, LmResponse, DEFAULT_MAX_FRAME_BYTES};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

const MAX_CONSECUTIVE_POLL_FAILURES: u32 = 3;

/// Tuning for [`HostPoller`].
#[derive(Debug, Clone)]
pub struct PollerOptions {
    /// Poll period. Default: 100 ms.
    pub interval: Duration,
    /// Cap on in-flight request forwards. Default: 16.
    pub max_in_flight: usize,
    /// TCP connect timeout toward the handler. Default: 5 s.
    pub connect_timeout: Duration,
    /// Frame size cap on the handler path.
    pub max_frame: usize,
}

impl Default for PollerOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            max_in_flight: 16,
            connect_timeout: Duration::from_secs(5),
            max_frame: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl PollerOptions {
    pub fn from_config(config: &crate::config::RlmConfig) -> Self {
        Self {
            interval: config.polling_interval(),
            max_in_flight: config.poller_max_in_flight,
            connect_timeout: config.connect_timeout(),
            max_frame: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// A background task draining one remote broker.
pub struct HostPoller {
    shutdown: CancellationToken,
    healthy: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl HostPoller {
    /// Start polling `{tunnel_url}/pending`, forwarding to the handler at
    /// `handler_addr`. `session_cancel` fires when the session must die
    /// (three consecutive poll failures).
    pub fn spawn(
        tunnel_url: String,
        handler_addr: SocketAddr,
        options: PollerOptions,
        session_cancel: CancellationToken,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let healthy = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(poll_loop(
            tunnel_url,
            handler_addr,
            options,
            shutdown.clone(),
            Arc::clone(&healthy),
            session_cancel,
        ));
        Self {
            shutdown,
            healthy,
            task,
        }
    }

    /// False once the broker has been unreachable for three consecutive
    /// polls.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}

async fn poll_loop(
    tunnel_url: String,
    handler_addr: SocketAddr,
    options: PollerOptions,
    shutdown: CancellationToken,
    healthy: Arc<AtomicBool>,
    session_cancel: CancellationToken,
) {
    let http = reqwest::Client::new();
    let semaphore = Arc::new(Semaphore::new(options.max_in_flight));
    let tracker = TaskTracker::new();
    let pending_url = format!("{}/pending", tunnel_url.trim_end_matches('/'));
    let respond_url = format!("{}/respond", tunnel_url.trim_end_matches('/'));
    let mut interval = tokio::time::interval(options.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut consecutive_failures = 0u32;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let batch = match poll_pending(&http, &pending_url).await {
            Ok(batch) => {
                consecutive_failures = 0;
                batch
            }
            Err(e) => {
                consecutive_failures += 1;
                warn!(error = %e, consecutive_failures, "broker poll failed");
                if consecutive_failures >= MAX_CONSECUTIVE_POLL_FAILURES {
                    healthy.store(false, Ordering::Relaxed);
                    session_cancel.cancel();
                    break;
                }
                continue;
            }
        };

        for request in batch {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => return,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => return,
                },
            };
            let http = http.clone();
            let respond_url = respond_url.clone();
            let connect_timeout = options.connect_timeout;
            let max_frame = options.max_frame;
            tracker.spawn(async move {
                forward_one(http, respond_url, handler_addr, request, connect_timeout, max_frame)
                    .await;
                drop(permit);
            });
        }
    }

    tracker.close();
    tracker.wait().await;
}

async fn poll_pending(
    http: &reqwest::Client,
    pending_url: &str,
) -> crate::error::Result<Vec<LmRequest>> {
    let resp = http.get(pending_url).send().await?.error_for_status()?;
    Ok(resp.json().await?)
}

/// Forward one request over framed TCP and post the outcome back to the
/// broker. A forwarding failure becomes an error response; the request is
/// not retried here.
async fn forward_one(
    http: reqwest::Client,
    respond_url: String,
    handler_addr: SocketAddr,
    request: LmRequest,
    connect_timeout: Duration,
    max_frame: usize,
) {
    let request_id = request.request_id;
    let response = match forward_tcp(handler_addr, &request, connect_timeout, max_frame).await {
        Ok(response) => response,
        Err(e) => {
            warn!(%request_id, error = %e, "forward to handler failed");
            LmResponse::err(request_id, e.wire_code())
        }
    };

    debug!(%request_id, "posting response to broker");
    let result = http
        .post(&respond_url)
        .json(&RespondBody {
            request_id,
            response,
        })
        .send()
        .await;
    if let Err(e) = result {
        warn!(%request_id, error = %e, "failed to post response to broker");
    }
}

async fn forward_tcp(
    addr: SocketAddr,
    request: &LmRequest,
    connect_timeout: Duration,
    max_frame: usize,
) -> crate::error::Result<LmResponse> {
    let mut stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| crate::error::RlmError::Timeout {
            what: "handler connect".into(),
            after: connect_timeout,
        })??;
    protocol::write_frame(&mut stream, request).await?;
    protocol::read_frame(&mut stream, max_frame).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::broker::Broker;
    use crate::client::LmClient;
    use crate::handler::{DepthRouter, HandlerOptions, LmHandler};
    use std::collections::BTreeMap;

    async fn start_handler(responses: Vec<&str>) -> LmHandler {
        let lm = Arc::new(
            LmClient::builder("http://unused")
                .backend(Arc::new(MockBackend::new(
                    responses.into_iter().map(String::from).collect(),
                )))
                .build(),
        );
        let mut models = BTreeMap::new();
        models.insert(0, "root".to_string());
        models.insert(1, "sub".to_string());
        LmHandler::bind(
            "127.0.0.1:0",
            lm,
            DepthRouter::new(models),
            HandlerOptions::default(),
        )
        .await
        .unwrap()
    }

    fn fast_options() -> PollerOptions {
        PollerOptions {
            interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_bridge_end_to_end() {
        let handler = start_handler(vec!["bridged answer"]).await;
        let broker = Broker::serve("127.0.0.1:0", Duration::from_secs(10)).await.unwrap();
        let poller = HostPoller::spawn(
            broker.url(),
            handler.local_addr(),
            fast_options(),
            CancellationToken::new(),
        );

        let request = LmRequest::from_prompt("sess", "over the bridge", 1);
        let response: LmResponse = reqwest::Client::new()
            .post(format!("{}/enqueue", broker.url()))
            .json(&request)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(response.content.as_deref(), Some("bridged answer"));
        assert_eq!(response.request_id, request.request_id);

        poller.stop().await;
        broker.stop().await;
        handler.stop().await;
    }

    #[tokio::test]
    async fn test_forward_failure_posted_as_error() {
        // Handler address with nothing listening: forwards fail, the broker
        // requeues once, the second failure is delivered to the waiter.
        let dead_addr: SocketAddr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
            // listener dropped here -- connections now refused
        };
        let broker = Broker::serve("127.0.0.1:0", Duration::from_secs(10)).await.unwrap();
        let poller = HostPoller::spawn(
            broker.url(),
            dead_addr,
            fast_options(),
            CancellationToken::new(),
        );

        let request = LmRequest::from_prompt("sess", "doomed", 1);
        let response: LmResponse = reqwest::Client::new()
            .post(format!("{}/enqueue", broker.url()))
            .json(&request)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(response.is_err());

        poller.stop().await;
        broker.stop().await;
    }

    #[tokio::test]
    async fn test_unreachable_broker_marks_unhealthy_and_cancels() {
        let session_cancel = CancellationToken::new();
        let handler = start_handler(vec!["unused"]).await;
        let poller = HostPoller::spawn(
            "http://127.0.0.1:1".to_string(),
            handler.local_addr(),
            fast_options(),
            session_cancel.clone(),
        );

        tokio::time::timeout(Duration::from_secs(5), session_cancel.cancelled())
            .await
            .expect("session cancel should fire after three failed polls");
        assert!(!poller.is_healthy());

        poller.stop().await;
        handler.stop().await;
    }
}
