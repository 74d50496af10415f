//! The REPL loop: outer LM ↔ environment until termination.
//!
//! One session at a time per instance. Each iteration asks the outer LM for
//! a turn, executes its fenced code blocks in document order, and feeds the
//! captured output back. The loop ends on the first code block that names a
//! final answer, on the iteration or token budget, on cancellation, or
//! after three consecutive infrastructure failures.
//!
//! Failure taxonomy matters here: a code block that *raises* is normal --
//! the error is recorded and shown to the model next turn. Outer-LM
//! failures and environment failures (a dead sandbox) each count toward
//! their own consecutive-error limit: a working outer LM must not mask a
//! sandbox that keeps dying, so the two counters reset independently.

use crate::client::LmClient;
use crate::config::RlmConfig;
use crate::environment::{Environment, ReplResult};
use crate::error::{Result, RlmError};
use crate::events::{emit, Event, EventHandler};
use crate::parsing::extract_code_blocks;
use crate::prompt::{execution_feedback, system_prompt};
use crate::protocol::{ChatMessage, LmRequest};
use crate::session::{Iteration, SessionLog, SessionOutcome, SessionState, StopReason};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_CONSECUTIVE_ERRORS: u32 = 3;

/// How one turn's block execution ended.
enum BlockPhase {
    /// All blocks ran (possibly with recorded user-code errors).
    Completed,
    /// A block named a final answer; later blocks were dropped.
    Final(Value),
    /// Cancellation observed mid-turn.
    Cancelled,
    /// The environment itself failed.
    EnvError,
    /// Sub-calls crossed the session token budget; later blocks were
    /// dropped.
    BudgetExhausted,
}

/// Drives one session of the outer loop.
pub struct ReplSession {
    config: RlmConfig,
    lm: Arc<LmClient>,
    env: Box<dyn Environment>,
    events: Option<Arc<dyn EventHandler>>,
    cancel: CancellationToken,
    state: SessionState,
}

impl ReplSession {
    /// `lm` is the outer-LM capability; `env` executes the code blocks.
    pub fn new(config: RlmConfig, lm: Arc<LmClient>, env: Box<dyn Environment>) -> Self {
        let session_id = Uuid::new_v4().to_string();
        Self {
            state: SessionState::new(session_id, 0),
            config,
            lm,
            env,
            events: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.state.session_id = session_id.into();
        self
    }

    pub fn with_events(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.events = Some(handler);
        self
    }

    /// Token observed for external cancellation. An isolated environment's
    /// `session_cancel` token belongs here so poller health failures stop
    /// the loop.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Run the session to termination. The environment is cleaned up and
    /// the session log written on every path out.
    pub async fn run(&mut self, question: &str, context: Value) -> Result<SessionOutcome> {
        self.config
            .validate()
            .map_err(RlmError::InvalidConfig)?;

        emit(
            &self.events,
            Event::SessionStart {
                session_id: self.state.session_id.clone(),
            },
        );
        info!(session_id = %self.state.session_id, "session starting");

        let outcome = self.run_loop(question, context).await;

        if let Err(e) = self.env.cleanup().await {
            warn!(error = %e, "environment cleanup failed");
        }

        if let Ok(ref outcome) = outcome {
            match SessionLog::write_to_env(&self.config, &self.state, outcome, Some(question)) {
                Ok(Some(path)) => debug!(path = %path.display(), "session log written"),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "failed to write session log"),
            }
            emit(
                &self.events,
                Event::SessionEnd {
                    session_id: self.state.session_id.clone(),
                    stop_reason: outcome.stop_reason.to_string(),
                },
            );
            info!(
                session_id = %self.state.session_id,
                stop_reason = %outcome.stop_reason,
                iterations = outcome.iterations,
                "session finished"
            );
        }

        outcome
    }

    async fn run_loop(&mut self, question: &str, context: Value) -> Result<SessionOutcome> {
        self.env.setup().await?;
        let context_chars = context.to_string().len();
        self.env.load_context(context).await?;
        self.state.context_loaded = true;

        let mut messages = vec![
            ChatMessage::system(system_prompt(
                &self.config.language_tag,
                context_chars,
                self.state.depth,
            )),
            ChatMessage::user(question),
        ];
        let mut final_answer: Option<Value> = None;
        let mut consecutive_lm_errors = 0u32;
        let mut consecutive_env_errors = 0u32;
        let mut stop_reason = StopReason::IterationBudget;

        for index in 0..self.config.max_iterations {
            if self.cancel.is_cancelled() {
                stop_reason = StopReason::Cancelled;
                break;
            }
            emit(
                &self.events,
                Event::IterationStart {
                    session_id: self.state.session_id.clone(),
                    index,
                },
            );
            let iteration_start = Instant::now();
            let outer_prompt = messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default();

            let request = LmRequest::from_prompt(&self.state.session_id, "", self.state.depth)
                .with_messages(messages.clone())
                .with_model(self.root_model().to_string());

            let outer = tokio::select! {
                _ = self.cancel.cancelled() => Err(RlmError::Cancelled),
                result = self.lm.acompletion(&request) => result,
            };

            let outer = match outer {
                Ok(completion) => completion,
                Err(RlmError::Cancelled) => {
                    stop_reason = StopReason::Cancelled;
                    break;
                }
                Err(e) => {
                    warn!(error = %e, iteration = index, "outer LM call failed");
                    consecutive_lm_errors += 1;
                    self.state.record(Iteration {
                        index,
                        outer_prompt,
                        outer_response: format!("[error] {}", e.wire_code()),
                        code_blocks: Vec::new(),
                        repl_results: Vec::new(),
                        sub_lm_calls: Vec::new(),
                        wall_time_ms: iteration_start.elapsed().as_millis() as u64,
                    });
                    if consecutive_lm_errors >= MAX_CONSECUTIVE_ERRORS {
                        stop_reason = StopReason::Error;
                        break;
                    }
                    continue;
                }
            };
            consecutive_lm_errors = 0;
            self.state.tokens_used += outer.usage.total();

            messages.push(ChatMessage::assistant(outer.text.clone()));
            let code_blocks = extract_code_blocks(&outer.text, &self.config.language_tag);
            debug!(iteration = index, blocks = code_blocks.len(), "outer turn parsed");

            // Budget is checked after each call, the outer one included: a
            // turn that already exhausted it does not get its blocks run.
            if self.budget_exhausted() {
                info!(tokens_used = self.state.tokens_used, "token budget exhausted");
                self.state.record(Iteration {
                    index,
                    outer_prompt,
                    outer_response: outer.text,
                    code_blocks,
                    repl_results: Vec::new(),
                    sub_lm_calls: Vec::new(),
                    wall_time_ms: iteration_start.elapsed().as_millis() as u64,
                });
                stop_reason = StopReason::TokenBudget;
                break;
            }

            let (phase, repl_results, sub_lm_calls, feedback_parts) =
                self.run_blocks(index, &code_blocks).await;

            self.state.record(Iteration {
                index,
                outer_prompt,
                outer_response: outer.text,
                code_blocks: code_blocks.clone(),
                repl_results,
                sub_lm_calls,
                wall_time_ms: iteration_start.elapsed().as_millis() as u64,
            });

            let feedback = if code_blocks.is_empty() {
                format!(
                    "No ```{}``` code block found. Emit code to continue, or bind \
                     your answer and call FINAL_VAR(name).",
                    self.config.language_tag
                )
            } else {
                feedback_parts.join("\n\n")
            };

            match phase {
                BlockPhase::Final(answer) => {
                    final_answer = Some(answer);
                    stop_reason = StopReason::FinalAnswer;
                    break;
                }
                BlockPhase::Cancelled => {
                    stop_reason = StopReason::Cancelled;
                    break;
                }
                BlockPhase::BudgetExhausted => {
                    info!(tokens_used = self.state.tokens_used, "token budget exhausted");
                    stop_reason = StopReason::TokenBudget;
                    break;
                }
                BlockPhase::EnvError => {
                    consecutive_env_errors += 1;
                    if consecutive_env_errors >= MAX_CONSECUTIVE_ERRORS {
                        stop_reason = StopReason::Error;
                        break;
                    }
                    // Keep the turns alternating even on a failed iteration.
                    messages.push(ChatMessage::user(feedback));
                }
                BlockPhase::Completed => {
                    consecutive_env_errors = 0;
                    messages.push(ChatMessage::user(feedback));
                }
            }
        }

        Ok(SessionOutcome {
            final_answer,
            stop_reason,
            iterations: self.state.iterations.len() as u32,
            tokens_used: self.state.tokens_used,
        })
    }

    /// Execute one turn's code blocks in document order. Stops early on a
    /// final answer, cancellation, an environment failure, or a crossed
    /// token budget.
    async fn run_blocks(
        &mut self,
        iteration: u32,
        code_blocks: &[String],
    ) -> (
        BlockPhase,
        Vec<ReplResult>,
        Vec<crate::dispatch::SubCallRecord>,
        Vec<String>,
    ) {
        let mut repl_results = Vec::new();
        let mut sub_lm_calls = Vec::new();
        let mut feedback_parts = Vec::new();

        for (block_index, block) in code_blocks.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return (BlockPhase::Cancelled, repl_results, sub_lm_calls, feedback_parts);
            }
            emit(
                &self.events,
                Event::CodeBlockStart {
                    session_id: self.state.session_id.clone(),
                    iteration,
                    block: block_index,
                },
            );

            let result = match self.env.execute_code(block).await {
                Ok(result) => result,
                Err(RlmError::Cancelled) => {
                    return (BlockPhase::Cancelled, repl_results, sub_lm_calls, feedback_parts);
                }
                Err(e) => {
                    // Environment failure, not user code: counts toward the
                    // consecutive-error limit. The failure still becomes
                    // feedback so the conversation keeps alternating.
                    warn!(error = %e, "environment failed to execute block");
                    let failed = ReplResult::failed(e.to_string());
                    feedback_parts.push(execution_feedback(block_index, &failed));
                    repl_results.push(failed);
                    return (BlockPhase::EnvError, repl_results, sub_lm_calls, feedback_parts);
                }
            };

            let mut budget_crossed = false;
            for call in self.env.drain_sub_calls() {
                // Checked after each call; the crossing call is the last
                // one the budget pays for.
                self.state.tokens_used += call.usage.total();
                if self.budget_exhausted() {
                    budget_crossed = true;
                }
                emit(
                    &self.events,
                    Event::SubLmCall {
                        session_id: self.state.session_id.clone(),
                        request_id: call.request_id,
                        depth: call.depth,
                    },
                );
                sub_lm_calls.push(call);
            }

            emit(
                &self.events,
                Event::CodeBlockEnd {
                    session_id: self.state.session_id.clone(),
                    iteration,
                    block: block_index,
                    ok: result.success,
                },
            );
            feedback_parts.push(execution_feedback(block_index, &result));
            let found_final = result.final_var.clone();
            repl_results.push(result);

            // First final answer wins; later blocks of this turn are
            // dropped.
            if let Some(answer) = found_final {
                return (
                    BlockPhase::Final(answer),
                    repl_results,
                    sub_lm_calls,
                    feedback_parts,
                );
            }

            // A final answer bound in this same block still counts; without
            // one, an exhausted budget stops the turn before the next block.
            if budget_crossed {
                return (
                    BlockPhase::BudgetExhausted,
                    repl_results,
                    sub_lm_calls,
                    feedback_parts,
                );
            }
        }

        (BlockPhase::Completed, repl_results, sub_lm_calls, feedback_parts)
    }

    fn budget_exhausted(&self) -> bool {
        self.config
            .max_tokens_per_session
            .is_some_and(|budget| self.state.tokens_used >= budget)
    }

    fn root_model(&self) -> &str {
        self.config
            .depth_model_map
            .get(&self.state.depth)
            .unwrap_or(&self.config.root_model)
    }
}
