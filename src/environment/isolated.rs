//! The isolated environment: sandboxed execution behind a broker.
//!
//! The host cannot open connections into a cloud sandbox, so everything
//! inverts: the sandbox runs the broker, publishes a tunnel URL, and a host
//! poller drains it (see [`crate::broker`] and [`crate::poller`]).
//!
//! Provider bootstrap is out of crate. A provider implements
//! [`SandboxProvider`]: provision a sandbox, start the broker and driver
//! inside it, and hand back a [`SandboxHandle`] exposing the tunnel URL and
//! a code-execution channel. [`InProcessSandbox`] ships here as the
//! reference provider -- broker on a loopback port, driver in-process -- and
//! is what tests and local development run against. It emulates the
//! short-lived remote driver faithfully: every `execute` builds a fresh
//! namespace and reloads state from the well-known state file, so variables
//! survive only through the serialization path, exactly as they must on a
//! real provider.

use crate::broker::Broker;
use crate::dispatch::{BrokerTransport, Dispatcher, SubCallRecord};
use crate::environment::namespace::SandboxNamespace;
use crate::environment::{Environment, ReplResult};
use crate::error::{Result, RlmError};
use crate::poller::{HostPoller, PollerOptions};
use async_trait::async_trait;
use serde_json::Value;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What a provider needs to know to provision one sandbox.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub session_id: String,
    /// Recursion level of the owning session.
    pub depth: u32,
    /// Broker-side per-request wait.
    pub enqueue_timeout: Duration,
    /// Per-code-block wall clock inside the driver.
    pub block_timeout: Duration,
    /// Bounded fan-out for batched sub-calls.
    pub batch_fanout: usize,
    /// Well-known path where the driver persists namespace state between
    /// calls.
    pub state_path: PathBuf,
}

impl SandboxSpec {
    pub fn new(session_id: impl Into<String>) -> Self {
        let session_id = session_id.into();
        let state_path = std::env::temp_dir().join(format!("rlm_state_{}.json", session_id));
        Self {
            session_id,
            depth: 0,
            enqueue_timeout: Duration::from_secs(600),
            block_timeout: Duration::from_secs(300),
            batch_fanout: 8,
            state_path,
        }
    }

    pub fn from_config(config: &crate::config::RlmConfig, session_id: impl Into<String>) -> Self {
        let mut spec = Self::new(session_id);
        spec.enqueue_timeout = config.enqueue_timeout();
        spec.block_timeout = config.block_timeout();
        spec.batch_fanout = config.batch_fanout;
        spec
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_enqueue_timeout(mut self, timeout: Duration) -> Self {
        self.enqueue_timeout = timeout;
        self
    }

    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    pub fn with_state_path(mut self, path: PathBuf) -> Self {
        self.state_path = path;
        self
    }
}

/// A provisioned, running sandbox.
#[async_trait]
pub trait SandboxHandle: Send {
    /// Broker base URL as reachable from the host.
    fn tunnel_url(&self) -> String;

    /// Bind `context` in the driver's namespace.
    async fn load_context(&mut self, payload: Value) -> Result<()>;

    /// Send one code block to the driver and await its result.
    async fn execute(&mut self, code: &str) -> Result<ReplResult>;

    /// Sub-LM calls issued by the driver since the last drain.
    fn drain_sub_calls(&mut self) -> Vec<SubCallRecord> {
        Vec::new()
    }

    /// Tear the sandbox down. Safe to call twice.
    async fn terminate(&mut self) -> Result<()>;
}

/// Provisions sandboxes satisfying the broker contract.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn provision(&self, spec: &SandboxSpec) -> Result<Box<dyn SandboxHandle>>;
}

/// The reference provider: broker on a loopback port, driver in-process.
pub struct InProcessSandbox;

#[async_trait]
impl SandboxProvider for InProcessSandbox {
    async fn provision(&self, spec: &SandboxSpec) -> Result<Box<dyn SandboxHandle>> {
        let broker = Broker::serve("127.0.0.1:0", spec.enqueue_timeout).await?;
        info!(url = %broker.url(), session_id = %spec.session_id, "in-process sandbox up");

        let transport = BrokerTransport::new(broker.url(), spec.enqueue_timeout);
        let dispatcher = Arc::new(
            Dispatcher::new(Arc::new(transport), spec.session_id.clone(), spec.depth)
                .with_fanout(spec.batch_fanout),
        );

        Ok(Box::new(InProcessHandle {
            tunnel_url: broker.url(),
            broker: Some(broker),
            dispatcher,
            context: None,
            block_timeout: spec.block_timeout,
            state_path: spec.state_path.clone(),
        }))
    }
}

struct InProcessHandle {
    tunnel_url: String,
    broker: Option<Broker>,
    dispatcher: Arc<Dispatcher>,
    context: Option<Value>,
    block_timeout: Duration,
    state_path: PathBuf,
}

impl InProcessHandle {
    /// Build the short-lived driver namespace: fresh engine, state reloaded
    /// from the well-known file, context rebound if the snapshot lacks it.
    fn fresh_namespace(&self) -> Result<SandboxNamespace> {
        let namespace = SandboxNamespace::new(Arc::clone(&self.dispatcher));

        let mut restored_context = false;
        if self.state_path.exists() {
            let raw = std::fs::read_to_string(&self.state_path)
                .map_err(|e| RlmError::Sandbox(format!("state file unreadable: {}", e)))?;
            let state: Value = serde_json::from_str(&raw)
                .map_err(|e| RlmError::Sandbox(format!("state file corrupt: {}", e)))?;
            restored_context = state.get("context").is_some();
            namespace.restore_state(&state)?;
        }
        if !restored_context {
            if let Some(ref context) = self.context {
                namespace.set_context(context)?;
            }
        }
        Ok(namespace)
    }
}

#[async_trait]
impl SandboxHandle for InProcessHandle {
    fn tunnel_url(&self) -> String {
        self.tunnel_url.clone()
    }

    async fn load_context(&mut self, payload: Value) -> Result<()> {
        self.context = Some(payload);
        Ok(())
    }

    async fn execute(&mut self, code: &str) -> Result<ReplResult> {
        if self.broker.is_none() {
            return Err(RlmError::Sandbox("sandbox already terminated".into()));
        }
        let namespace = self.fresh_namespace()?;
        let code = code.to_string();
        let timeout = self.block_timeout;

        let (result, state) = tokio::task::spawn_blocking(move || {
            let result = namespace.execute(&code, timeout);
            (result, namespace.snapshot_state())
        })
        .await
        .map_err(|e| RlmError::Sandbox(format!("driver task failed: {}", e)))?;

        let raw = serde_json::to_string(&state)?;
        std::fs::write(&self.state_path, raw)
            .map_err(|e| RlmError::Sandbox(format!("state file unwritable: {}", e)))?;
        debug!(path = %self.state_path.display(), "driver state persisted");

        Ok(result)
    }

    fn drain_sub_calls(&mut self) -> Vec<SubCallRecord> {
        self.dispatcher.take_sub_calls()
    }

    async fn terminate(&mut self) -> Result<()> {
        if let Some(broker) = self.broker.take() {
            broker.stop().await;
        }
        let _ = std::fs::remove_file(&self.state_path);
        Ok(())
    }
}

/// The isolated execution environment: provisions a sandbox, starts the
/// host poller against its tunnel, and forwards code to the driver.
pub struct IsolatedEnvironment {
    provider: Box<dyn SandboxProvider>,
    spec: SandboxSpec,
    handler_addr: SocketAddr,
    poller_options: PollerOptions,
    session_cancel: CancellationToken,
    handle: Option<Box<dyn SandboxHandle>>,
    poller: Option<HostPoller>,
}

impl IsolatedEnvironment {
    pub fn new(
        provider: Box<dyn SandboxProvider>,
        handler_addr: SocketAddr,
        spec: SandboxSpec,
    ) -> Self {
        Self {
            provider,
            spec,
            handler_addr,
            poller_options: PollerOptions::default(),
            session_cancel: CancellationToken::new(),
            handle: None,
            poller: None,
        }
    }

    pub fn with_poller_options(mut self, options: PollerOptions) -> Self {
        self.poller_options = options;
        self
    }

    /// Fires when the session must die -- on poller health failure, or when
    /// the owner cancels it. The REPL loop watches this token.
    pub fn session_cancel(&self) -> CancellationToken {
        self.session_cancel.clone()
    }
}

#[async_trait]
impl Environment for IsolatedEnvironment {
    async fn setup(&mut self) -> Result<()> {
        let handle = self.provider.provision(&self.spec).await?;
        let poller = HostPoller::spawn(
            handle.tunnel_url(),
            self.handler_addr,
            self.poller_options.clone(),
            self.session_cancel.clone(),
        );
        self.handle = Some(handle);
        self.poller = Some(poller);
        Ok(())
    }

    async fn load_context(&mut self, payload: Value) -> Result<()> {
        self.handle
            .as_mut()
            .ok_or_else(|| RlmError::Sandbox("environment not set up".into()))?
            .load_context(payload)
            .await
    }

    async fn execute_code(&mut self, code: &str) -> Result<ReplResult> {
        if self.session_cancel.is_cancelled() {
            return Err(RlmError::Cancelled);
        }
        self.handle
            .as_mut()
            .ok_or_else(|| RlmError::Sandbox("environment not set up".into()))?
            .execute(code)
            .await
    }

    fn drain_sub_calls(&mut self) -> Vec<SubCallRecord> {
        self.handle
            .as_mut()
            .map(|h| h.drain_sub_calls())
            .unwrap_or_default()
    }

    async fn cleanup(&mut self) -> Result<()> {
        self.session_cancel.cancel();
        if let Some(poller) = self.poller.take() {
            poller.stop().await;
        }
        if let Some(mut handle) = self.handle.take() {
            handle.terminate().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::client::LmClient;
    use crate::handler::{DepthRouter, HandlerOptions, LmHandler};
    use serde_json::json;
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

    fn fast_poller() -> PollerOptions {
        PollerOptions {
            interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn spec(dir: &tempfile::TempDir, session: &str) -> SandboxSpec {
        SandboxSpec::new(session).with_state_path(dir.path().join("rlm_state.json"))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sub_call_through_broker_and_poller() {
        let handler = start_handler(vec!["4"]).await;
        let dir = tempfile::tempdir().unwrap();
        let mut env = IsolatedEnvironment::new(
            Box::new(InProcessSandbox),
            handler.local_addr(),
            spec(&dir, "iso-1"),
        )
        .with_poller_options(fast_poller());

        env.setup().await.unwrap();
        env.load_context(json!("the question")).await.unwrap();

        let result = env
            .execute_code(
                r#"
                    let answer = llm_query("what is 2+2?");
                    FINAL_VAR("answer");
                "#,
            )
            .await
            .unwrap();
        assert!(result.success, "stderr: {}", result.stderr);
        assert_eq!(result.final_var, Some(json!("4")));

        let calls = env.drain_sub_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].depth, 1);

        env.cleanup().await.unwrap();
        handler.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_state_survives_short_lived_driver() {
        let handler = start_handler(vec!["unused"]).await;
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("rlm_state.json");
        let mut env = IsolatedEnvironment::new(
            Box::new(InProcessSandbox),
            handler.local_addr(),
            SandboxSpec::new("iso-2").with_state_path(state_path.clone()),
        )
        .with_poller_options(fast_poller());

        env.setup().await.unwrap();
        env.execute_code("let carried = 41;").await.unwrap();
        assert!(state_path.exists());

        // A fresh driver namespace serves this call; the variable must come
        // back through the state file.
        let result = env.execute_code("carried += 1; print(carried);").await.unwrap();
        assert!(result.success, "stderr: {}", result.stderr);
        assert_eq!(result.stdout, "42\n");

        env.cleanup().await.unwrap();
        assert!(!state_path.exists());
        handler.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_context_rebinds_across_driver_restarts() {
        let handler = start_handler(vec!["unused"]).await;
        let dir = tempfile::tempdir().unwrap();
        let mut env = IsolatedEnvironment::new(
            Box::new(InProcessSandbox),
            handler.local_addr(),
            spec(&dir, "iso-3"),
        )
        .with_poller_options(fast_poller());

        env.setup().await.unwrap();
        env.load_context(json!({"topic": "ordering"})).await.unwrap();

        let first = env.execute_code("print(context.topic);").await.unwrap();
        assert_eq!(first.stdout, "ordering\n");
        let second = env.execute_code("print(context.topic);").await.unwrap();
        assert_eq!(second.stdout, "ordering\n");

        env.cleanup().await.unwrap();
        handler.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cleanup_twice_and_execute_after_cleanup() {
        let handler = start_handler(vec!["unused"]).await;
        let dir = tempfile::tempdir().unwrap();
        let mut env = IsolatedEnvironment::new(
            Box::new(InProcessSandbox),
            handler.local_addr(),
            spec(&dir, "iso-4"),
        )
        .with_poller_options(fast_poller());

        env.setup().await.unwrap();
        env.cleanup().await.unwrap();
        env.cleanup().await.unwrap();
        assert!(env.execute_code("1 + 1;").await.is_err());
        handler.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_batched_calls_over_broker_keep_order() {
        let handler = start_handler(vec!["A", "B", "C"]).await;
        let dir = tempfile::tempdir().unwrap();
        let mut env = IsolatedEnvironment::new(
            Box::new(InProcessSandbox),
            handler.local_addr(),
            spec(&dir, "iso-5"),
        )
        .with_poller_options(fast_poller());

        env.setup().await.unwrap();
        let result = env
            .execute_code(
                r#"
                    let replies = llm_query_batched(["a", "b", "c"]);
                    print(replies.len());
                "#,
            )
            .await
            .unwrap();
        assert!(result.success, "stderr: {}", result.stderr);
        assert_eq!(result.stdout, "3\n");
        assert_eq!(env.drain_sub_calls().len(), 3);

        env.cleanup().await.unwrap();
        handler.stop().await;
    }
}
