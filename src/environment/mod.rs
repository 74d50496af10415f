//! Execution environments: where the outer LM's code blocks run.
//!
//! Two variants share one contract. The **local** environment runs the
//! sandbox namespace in-process and dispatches sub-LM calls over direct
//! framed TCP. The **isolated** environment provisions a remote sandbox,
//! starts the broker inside it, and bridges sub-LM calls through the host
//! poller -- the host can never connect *into* the sandbox, only poll out
//! of it.
//!
//! Every environment guarantees: the namespace persists between
//! `execute_code` calls within one instance, and `cleanup` is idempotent
//! and releases all external resources on every path.

pub mod isolated;
pub mod local;
pub mod namespace;

pub use isolated::{
    InProcessSandbox, IsolatedEnvironment, SandboxHandle, SandboxProvider, SandboxSpec,
};
pub use local::LocalEnvironment;
pub use namespace::SandboxNamespace;

use crate::dispatch::SubCallRecord;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The outcome of executing one code block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplResult {
    /// Captured print output.
    pub stdout: String,
    /// Error text from a failed evaluation, empty on success.
    pub stderr: String,
    /// Whether the block ran to completion.
    pub success: bool,
    /// Set when the block raised: the error message, or `"timeout"` /
    /// `"cancelled"` when the block was interrupted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
    /// Set iff the block named a final answer via `FINAL_VAR`. The value is
    /// the binding's value when the block finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_var: Option<Value>,
}

impl ReplResult {
    /// A result for a block that could not run at all.
    pub fn failed(exception: impl Into<String>) -> Self {
        let exception = exception.into();
        Self {
            stdout: String::new(),
            stderr: exception.clone(),
            success: false,
            exception: Some(exception),
            final_var: None,
        }
    }
}

/// A place to execute code blocks with a persistent namespace.
#[async_trait]
pub trait Environment: Send {
    /// Install the capability set (`llm_query`, `llm_query_batched`,
    /// `FINAL_VAR`) and acquire any external resources.
    async fn setup(&mut self) -> Result<()>;

    /// Bind `context` in the namespace.
    async fn load_context(&mut self, payload: Value) -> Result<()>;

    /// Run one code block. Raised errors come back inside the
    /// [`ReplResult`], not as an `Err` -- only infrastructure failures
    /// (a dead sandbox, a lost driver) error out.
    async fn execute_code(&mut self, code: &str) -> Result<ReplResult>;

    /// Sub-LM calls issued since the last drain, for the iteration record.
    fn drain_sub_calls(&mut self) -> Vec<SubCallRecord> {
        Vec::new()
    }

    /// Release all external resources. Safe to call twice.
    async fn cleanup(&mut self) -> Result<()>;
}
