//! The non-isolated environment: sandbox namespace in the host process.
//!
//! Sub-LM calls go straight to the LM Handler over framed TCP -- no broker,
//! no poller. Blocks evaluate on a blocking thread so the async runtime
//! stays responsive; the per-block deadline interrupts runaway scripts.

use crate::dispatch::{Dispatcher, SubCallRecord, TcpTransport};
use crate::environment::namespace::SandboxNamespace;
use crate::environment::{Environment, ReplResult};
use crate::error::{Result, RlmError};
use async_trait::async_trait;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// In-process execution environment.
pub struct LocalEnvironment {
    handler_addr: SocketAddr,
    session_id: String,
    depth: u32,
    block_timeout: Duration,
    connect_timeout: Duration,
    batch_fanout: usize,
    namespace: Option<Arc<SandboxNamespace>>,
    dispatcher: Option<Arc<Dispatcher>>,
}

impl LocalEnvironment {
    pub fn new(handler_addr: SocketAddr, session_id: impl Into<String>) -> Self {
        Self {
            handler_addr,
            session_id: session_id.into(),
            depth: 0,
            block_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(5),
            batch_fanout: 8,
            namespace: None,
            dispatcher: None,
        }
    }

    pub fn from_config(
        config: &crate::config::RlmConfig,
        handler_addr: SocketAddr,
        session_id: impl Into<String>,
    ) -> Self {
        Self::new(handler_addr, session_id)
            .with_block_timeout(config.block_timeout())
            .with_connect_timeout(config.connect_timeout())
            .with_batch_fanout(config.batch_fanout)
    }

    /// Recursion level of the session owning this environment; sub-LM calls
    /// from inside it are tagged one deeper.
    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_batch_fanout(mut self, fanout: usize) -> Self {
        self.batch_fanout = fanout;
        self
    }

    /// The namespace cancellation flag, once set up.
    pub fn cancel_flag(&self) -> Option<Arc<std::sync::atomic::AtomicBool>> {
        self.namespace.as_ref().map(|ns| ns.cancel_flag())
    }

    fn namespace(&self) -> Result<&Arc<SandboxNamespace>> {
        self.namespace
            .as_ref()
            .ok_or_else(|| RlmError::Sandbox("environment not set up".into()))
    }
}

#[async_trait]
impl Environment for LocalEnvironment {
    async fn setup(&mut self) -> Result<()> {
        let transport =
            TcpTransport::new(self.handler_addr).with_connect_timeout(self.connect_timeout);
        let dispatcher = Arc::new(
            Dispatcher::new(Arc::new(transport), self.session_id.clone(), self.depth)
                .with_fanout(self.batch_fanout),
        );
        self.namespace = Some(Arc::new(SandboxNamespace::new(Arc::clone(&dispatcher))));
        self.dispatcher = Some(dispatcher);
        Ok(())
    }

    async fn load_context(&mut self, payload: Value) -> Result<()> {
        self.namespace()?.set_context(&payload)
    }

    async fn execute_code(&mut self, code: &str) -> Result<ReplResult> {
        let namespace = Arc::clone(self.namespace()?);
        let code = code.to_string();
        let timeout = self.block_timeout;
        tokio::task::spawn_blocking(move || namespace.execute(&code, timeout))
            .await
            .map_err(|e| RlmError::Sandbox(format!("execution task failed: {}", e)))
    }

    fn drain_sub_calls(&mut self) -> Vec<SubCallRecord> {
        self.dispatcher
            .as_ref()
            .map(|d| d.take_sub_calls())
            .unwrap_or_default()
    }

    async fn cleanup(&mut self) -> Result<()> {
        if let Some(ns) = self.namespace.take() {
            ns.cancel_flag()
                .store(true, std::sync::atomic::Ordering::Relaxed);
            ns.clear();
        }
        self.dispatcher = None;
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

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_namespace_persists_through_trait() {
        let handler = start_handler(vec!["unused"]).await;
        let mut env = LocalEnvironment::new(handler.local_addr(), "sess");
        env.setup().await.unwrap();

        env.execute_code("let total = 40;").await.unwrap();
        let result = env.execute_code("total += 2; print(total);").await.unwrap();
        assert!(result.success, "stderr: {}", result.stderr);
        assert_eq!(result.stdout, "42\n");

        env.cleanup().await.unwrap();
        handler.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sub_call_through_handler() {
        let handler = start_handler(vec!["4"]).await;
        let mut env = LocalEnvironment::new(handler.local_addr(), "sess");
        env.setup().await.unwrap();
        env.load_context(json!({"question": "arithmetic"})).await.unwrap();

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

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_execute_before_setup_fails() {
        let handler = start_handler(vec!["unused"]).await;
        let mut env = LocalEnvironment::new(handler.local_addr(), "sess");
        assert!(env.execute_code("1 + 1;").await.is_err());
        handler.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cleanup_twice_is_safe() {
        let handler = start_handler(vec!["unused"]).await;
        let mut env = LocalEnvironment::new(handler.local_addr(), "sess");
        env.setup().await.unwrap();
        env.cleanup().await.unwrap();
        env.cleanup().await.unwrap();
        handler.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_block_timeout_interrupts() {
        let handler = start_handler(vec!["unused"]).await;
        let mut env = LocalEnvironment::new(handler.local_addr(), "sess")
            .with_block_timeout(Duration::from_millis(100));
        env.setup().await.unwrap();

        let result = env
            .execute_code("let n = 0; while true { n += 1; }")
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.exception.as_deref(), Some("timeout"));

        env.cleanup().await.unwrap();
        handler.stop().await;
    }
}
