//! # RLM Runtime
//!
//! A recursive language-model execution substrate: an outer LM drives a
//! REPL loop, each of its turns may emit code, the code runs in a sandbox,
//! and sandboxed code is free to issue *further* LM queries -- recursive
//! sub-calls, depth-tagged and routed to per-depth models -- until the code
//! names a final answer.
//!
//! ## Core Concepts
//!
//! - **[`ReplSession`]** -- the loop: outer LM ↔ environment, budgets,
//!   final-answer detection.
//! - **[`LmHandler`]** -- concurrent TCP server servicing LM requests from
//!   any number of in-flight sandboxes, with depth-based model routing.
//! - **[`LmClient`]** -- the LM capability: one handle over any
//!   [`Backend`](backend::Backend), with retry and usage accounting.
//! - **[`Environment`]** -- `setup` / `load_context` / `execute_code` /
//!   `cleanup` over local and sandboxed executors. Sandbox code sees
//!   `llm_query`, `llm_query_batched`, `FINAL_VAR`, and `context`.
//! - **[`Broker`](broker::Broker)** / **[`HostPoller`](poller::HostPoller)**
//!   -- the inverted-control bridge for isolated sandboxes the host cannot
//!   connect into: the sandbox enqueues, the host polls and responds.
//!
//! ## Quick Start
//!
//! ```no_run
//! use rlm_runtime::{LmClient, LmHandler, ReplSession, RlmConfig};
//! use rlm_runtime::environment::LocalEnvironment;
//! use rlm_runtime::handler::{DepthRouter, HandlerOptions};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RlmConfig::default()
//!         .with_root_model("gpt-4o")
//!         .with_sub_model("gpt-4o-mini");
//!
//!     let lm = Arc::new(
//!         LmClient::builder(&config.base_url)
//!             .backend(config.backend.instantiate())
//!             .build(),
//!     );
//!     let handler = LmHandler::bind(
//!         "127.0.0.1:0",
//!         Arc::clone(&lm),
//!         DepthRouter::from_config(&config),
//!         HandlerOptions::default(),
//!     )
//!     .await?;
//!
//!     let env = Box::new(LocalEnvironment::new(handler.local_addr(), "demo"));
//!     let mut session = ReplSession::new(config, lm, env);
//!     let outcome = session
//!         .run("What is 2 + 2?", json!("the working context"))
//!         .await?;
//!
//!     println!("{:?}", outcome.final_answer);
//!     handler.stop().await;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod broker;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod environment;
pub mod error;
pub mod events;
pub mod handler;
pub mod parsing;
pub mod poller;
pub mod prompt;
pub mod protocol;
pub mod repl;
pub mod session;
pub mod usage;

pub use backend::{AnthropicBackend, BackoffConfig, MockBackend, OpenAiBackend};
pub use client::{LmClient, LmClientBuilder};
pub use config::{BackendKind, EnvironmentKind, RlmConfig};
pub use environment::{
    Environment, InProcessSandbox, IsolatedEnvironment, LocalEnvironment, ReplResult,
};
pub use error::{Result, RlmError};
pub use handler::LmHandler;
pub use protocol::{ChatMessage, LmRequest, LmResponse, Role, Usage};
pub use repl::ReplSession;
pub use session::{Iteration, SessionOutcome, SessionState, StopReason};
pub use usage::UsageSummary;
