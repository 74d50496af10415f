//! Session state, iteration records, and the session log document.
//!
//! A session is one run of the REPL loop. Its state is created on start,
//! mutated only by the loop, and torn down after the final iteration. The
//! iteration list is append-only -- it is the ground truth the log document
//! is built from.

use crate::config::RlmConfig;
use crate::dispatch::SubCallRecord;
use crate::environment::ReplResult;
use crate::error::{Result, RlmError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// A code block named a final answer via the sentinel.
    FinalAnswer,
    /// `max_iterations` reached without a final answer.
    IterationBudget,
    /// `max_tokens_per_session` exhausted.
    TokenBudget,
    /// Three consecutive iterations failed, or the environment died.
    Error,
    /// Cancelled from outside (or by poller health failure).
    Cancelled,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StopReason::FinalAnswer => "final_answer",
            StopReason::IterationBudget => "iteration_budget",
            StopReason::TokenBudget => "token_budget",
            StopReason::Error => "error",
            StopReason::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// One outer-LM turn and everything it caused. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iteration {
    pub index: u32,
    pub outer_prompt: String,
    pub outer_response: String,
    pub code_blocks: Vec<String>,
    pub repl_results: Vec<ReplResult>,
    pub sub_lm_calls: Vec<SubCallRecord>,
    pub wall_time_ms: u64,
}

impl Iteration {
    /// Whether anything in this iteration failed.
    pub fn has_errors(&self) -> bool {
        self.repl_results.iter().any(|r| !r.success)
    }
}

/// Mutable state of one running session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionState {
    pub session_id: String,
    pub iterations: Vec<Iteration>,
    pub context_loaded: bool,
    pub depth: u32,
    /// Outer-call tokens consumed so far, for the session budget check.
    pub tokens_used: u64,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>, depth: u32) -> Self {
        Self {
            session_id: session_id.into(),
            iterations: Vec::new(),
            context_loaded: false,
            depth,
            tokens_used: 0,
        }
    }

    pub fn record(&mut self, iteration: Iteration) {
        self.iterations.push(iteration);
    }

    pub fn total_code_blocks(&self) -> usize {
        self.iterations.iter().map(|i| i.code_blocks.len()).sum()
    }

    pub fn total_sub_lm_calls(&self) -> usize {
        self.iterations.iter().map(|i| i.sub_lm_calls.len()).sum()
    }

    pub fn total_wall_time_ms(&self) -> u64 {
        self.iterations.iter().map(|i| i.wall_time_ms).sum()
    }

    pub fn has_errors(&self) -> bool {
        self.iterations.iter().any(Iteration::has_errors)
    }
}

/// The terminal result of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionOutcome {
    pub final_answer: Option<Value>,
    pub stop_reason: StopReason,
    pub iterations: u32,
    pub tokens_used: u64,
}

/// Builds and writes the per-session log document consumed by the
/// visualizer.
pub struct SessionLog;

impl SessionLog {
    /// One JSON document per session.
    pub fn build(
        config: &RlmConfig,
        state: &SessionState,
        outcome: &SessionOutcome,
        context_question: Option<&str>,
    ) -> Value {
        json!({
            "config": {
                "root_model": config.root_model,
                "backend": config.backend.to_string(),
                "environment_type": config.environment_type.to_string(),
            },
            "metadata": {
                "totalIterations": state.iterations.len(),
                "totalCodeBlocks": state.total_code_blocks(),
                "totalSubLMCalls": state.total_sub_lm_calls(),
                "totalExecutionTime": state.total_wall_time_ms(),
                "finalAnswer": outcome.final_answer,
                "hasErrors": state.has_errors(),
                "contextQuestion": context_question,
            },
            "iterations": state.iterations,
        })
    }

    /// Write the document to `{dir}/{session_id}.json`.
    pub fn write_to(
        dir: &std::path::Path,
        config: &RlmConfig,
        state: &SessionState,
        outcome: &SessionOutcome,
        context_question: Option<&str>,
    ) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let doc = Self::build(config, state, outcome, context_question);
        let path = dir.join(format!("{}.json", state.session_id));
        std::fs::write(&path, serde_json::to_vec_pretty(&doc)?)
            .map_err(|e| RlmError::Other(format!("failed to write session log: {}", e)))?;
        Ok(path)
    }

    /// Write to the directory named by `RLM_LOG_DIR`, if set.
    pub fn write_to_env(
        config: &RlmConfig,
        state: &SessionState,
        outcome: &SessionOutcome,
        context_question: Option<&str>,
    ) -> Result<Option<PathBuf>> {
        match std::env::var("RLM_LOG_DIR") {
            Ok(dir) if !dir.is_empty() => Ok(Some(Self::write_to(
                std::path::Path::new(&dir),
                config,
                state,
                outcome,
                context_question,
            )?)),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Usage;
    use uuid::Uuid;

    fn sample_state() -> SessionState {
        let mut state = SessionState::new("sess-log", 0);
        state.record(Iteration {
            index: 0,
            outer_prompt: "prompt".into(),
            outer_response: "```rhai\nlet x = 1;\n```".into(),
            code_blocks: vec!["let x = 1;".into()],
            repl_results: vec![ReplResult {
                stdout: String::new(),
                stderr: String::new(),
                success: true,
                exception: None,
                final_var: None,
            }],
            sub_lm_calls: vec![SubCallRecord {
                request_id: Uuid::new_v4(),
                depth: 1,
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 5,
                    cache_read: None,
                    cache_write: None,
                },
            }],
            wall_time_ms: 120,
        });
        state.record(Iteration {
            index: 1,
            outer_prompt: "prompt".into(),
            outer_response: "```rhai\nboom();\n```".into(),
            code_blocks: vec!["boom();".into()],
            repl_results: vec![ReplResult::failed("boom")],
            sub_lm_calls: vec![],
            wall_time_ms: 40,
        });
        state
    }

    fn sample_outcome() -> SessionOutcome {
        SessionOutcome {
            final_answer: Some(json!(42)),
            stop_reason: StopReason::FinalAnswer,
            iterations: 2,
            tokens_used: 100,
        }
    }

    #[test]
    fn test_log_document_shape() {
        let config = RlmConfig::default();
        let state = sample_state();
        let doc = SessionLog::build(&config, &state, &sample_outcome(), Some("what is x?"));

        assert_eq!(doc["config"]["root_model"], config.root_model);
        assert_eq!(doc["config"]["backend"], "openai");
        assert_eq!(doc["config"]["environment_type"], "local");
        assert_eq!(doc["metadata"]["totalIterations"], 2);
        assert_eq!(doc["metadata"]["totalCodeBlocks"], 2);
        assert_eq!(doc["metadata"]["totalSubLMCalls"], 1);
        assert_eq!(doc["metadata"]["totalExecutionTime"], 160);
        assert_eq!(doc["metadata"]["finalAnswer"], 42);
        assert_eq!(doc["metadata"]["hasErrors"], true);
        assert_eq!(doc["metadata"]["contextQuestion"], "what is x?");
        assert_eq!(doc["iterations"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_write_creates_file_named_by_session() {
        let dir = tempfile::tempdir().unwrap();
        let config = RlmConfig::default();
        let state = sample_state();
        let path =
            SessionLog::write_to(dir.path(), &config, &state, &sample_outcome(), None).unwrap();

        assert_eq!(path.file_name().unwrap(), "sess-log.json");
        let raw = std::fs::read_to_string(&path).unwrap();
        let doc: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["metadata"]["totalIterations"], 2);
        assert_eq!(doc["metadata"]["contextQuestion"], Value::Null);
    }

    #[test]
    fn test_stop_reason_display() {
        assert_eq!(StopReason::IterationBudget.to_string(), "iteration_budget");
        assert_eq!(StopReason::FinalAnswer.to_string(), "final_answer");
    }

    #[test]
    fn test_state_counters() {
        let state = sample_state();
        assert_eq!(state.total_code_blocks(), 2);
        assert_eq!(state.total_sub_lm_calls(), 1);
        assert!(state.has_errors());
    }
}
