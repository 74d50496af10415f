//! The sandbox namespace: a scripted scope with injected capabilities.
//!
//! Code blocks are [rhai] scripts evaluated against a persistent
//! [`Scope`] -- variables declared in one block are visible to the next.
//! Setup registers the capability set into the engine:
//!
//! - `llm_query(prompt)` / `llm_query(prompt, model)` -- one recursive
//!   sub-LM call, returning the response text or the error sentinel;
//! - `llm_query_batched(prompts)` / `llm_query_batched(prompts, model)` --
//!   concurrent calls, results in input order;
//! - `FINAL_VAR(name)` -- marks the session's final answer;
//! - `print` / `debug` output is captured into the result's stdout.
//!
//! Interruption uses the engine's progress hook: the per-block deadline and
//! the cancellation flag are checked every few thousand operations, and a
//! tripped check terminates the script, which surfaces as
//! `exception = "timeout"` or `"cancelled"`.

use crate::dispatch::Dispatcher;
use crate::environment::ReplResult;
use rhai::{Dynamic, Engine, Scope};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// Names injected into the namespace at setup.
pub const CAPABILITIES: &[&str] = &["llm_query", "llm_query_batched", "FINAL_VAR", "context"];

/// How often (in engine operations) the progress hook checks for
/// interruption.
const PROGRESS_CHECK_MASK: u64 = 0xFFF;

/// A persistent scripted namespace with the capability set installed.
///
/// Shared handles let `execute` run on a blocking thread while the owner
/// keeps control of cancellation and state snapshots.
pub struct SandboxNamespace {
    engine: Arc<Engine>,
    scope: Arc<Mutex<Scope<'static>>>,
    stdout: Arc<Mutex<String>>,
    final_name: Arc<Mutex<Option<String>>>,
    deadline: Arc<Mutex<Option<Instant>>>,
    cancel: Arc<AtomicBool>,
}

impl SandboxNamespace {
    /// Build a namespace whose sub-LM capabilities route through the given
    /// dispatcher.
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        let stdout: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
        let final_name: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let deadline: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
        let cancel = Arc::new(AtomicBool::new(false));

        let mut engine = Engine::new();

        {
            let stdout = Arc::clone(&stdout);
            engine.on_print(move |text| {
                let mut buf = stdout.lock().expect("stdout buffer poisoned");
                buf.push_str(text);
                buf.push('\n');
            });
        }
        {
            let stdout = Arc::clone(&stdout);
            engine.on_debug(move |text, _source, pos| {
                let mut buf = stdout.lock().expect("stdout buffer poisoned");
                buf.push_str(&format!("[debug {:?}] {}\n", pos, text));
            });
        }

        {
            let deadline = Arc::clone(&deadline);
            let cancel = Arc::clone(&cancel);
            engine.on_progress(move |ops| {
                if ops & PROGRESS_CHECK_MASK != 0 {
                    return None;
                }
                if cancel.load(Ordering::Relaxed) {
                    return Some(Dynamic::from("cancelled"));
                }
                let expired = deadline
                    .lock()
                    .expect("deadline poisoned")
                    .is_some_and(|d| Instant::now() >= d);
                if expired {
                    return Some(Dynamic::from("timeout"));
                }
                None
            });
        }

        {
            let d = Arc::clone(&dispatcher);
            engine.register_fn("llm_query", move |prompt: &str| -> String {
                d.llm_query(prompt, None)
            });
        }
        {
            let d = Arc::clone(&dispatcher);
            engine.register_fn("llm_query", move |prompt: &str, model: &str| -> String {
                d.llm_query(prompt, Some(model))
            });
        }
        {
            let d = Arc::clone(&dispatcher);
            engine.register_fn(
                "llm_query_batched",
                move |prompts: rhai::Array| -> rhai::Array {
                    let prompts: Vec<String> = prompts
                        .into_iter()
                        .map(|p| p.into_string().unwrap_or_default())
                        .collect();
                    d.llm_query_batched(&prompts, None)
                        .into_iter()
                        .map(Dynamic::from)
                        .collect()
                },
            );
        }
        {
            let d = Arc::clone(&dispatcher);
            engine.register_fn(
                "llm_query_batched",
                move |prompts: rhai::Array, model: &str| -> rhai::Array {
                    let prompts: Vec<String> = prompts
                        .into_iter()
                        .map(|p| p.into_string().unwrap_or_default())
                        .collect();
                    d.llm_query_batched(&prompts, Some(model))
                        .into_iter()
                        .map(Dynamic::from)
                        .collect()
                },
            );
        }
        {
            let final_name = Arc::clone(&final_name);
            engine.register_fn("FINAL_VAR", move |name: &str| {
                *final_name.lock().expect("final marker poisoned") = Some(name.to_string());
            });
        }

        Self {
            engine: Arc::new(engine),
            scope: Arc::new(Mutex::new(Scope::new())),
            stdout,
            final_name,
            deadline,
            cancel,
        }
    }

    /// The cancellation flag; setting it interrupts the running block at
    /// the next progress check.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Bind `context` in the scope.
    pub fn set_context(&self, payload: &Value) -> crate::error::Result<()> {
        let dynamic = rhai::serde::to_dynamic(payload)
            .map_err(|e| crate::error::RlmError::Sandbox(format!("context not bindable: {}", e)))?;
        self.scope
            .lock()
            .expect("scope poisoned")
            .push_dynamic("context", dynamic);
        Ok(())
    }

    /// Evaluate one code block with a wall-clock deadline. Synchronous --
    /// callers in async contexts run this on a blocking thread.
    pub fn execute(&self, code: &str, timeout: Duration) -> ReplResult {
        {
            self.stdout.lock().expect("stdout buffer poisoned").clear();
            *self.final_name.lock().expect("final marker poisoned") = None;
            *self.deadline.lock().expect("deadline poisoned") = Some(Instant::now() + timeout);
        }

        let eval = {
            let mut scope = self.scope.lock().expect("scope poisoned");
            self.engine.run_with_scope(&mut scope, code)
        };
        *self.deadline.lock().expect("deadline poisoned") = None;

        let stdout = self.stdout.lock().expect("stdout buffer poisoned").clone();
        let mut result = match eval {
            Ok(()) => ReplResult {
                stdout,
                stderr: String::new(),
                success: true,
                exception: None,
                final_var: None,
            },
            Err(err) => {
                let exception = match *err {
                    rhai::EvalAltResult::ErrorTerminated(ref token, _) => {
                        token.clone().into_string().unwrap_or_else(|_| "interrupted".into())
                    }
                    _ => err.to_string(),
                };
                debug!(%exception, "code block failed");
                ReplResult {
                    stdout,
                    stderr: exception.clone(),
                    success: false,
                    exception: Some(exception),
                    final_var: None,
                }
            }
        };

        // FINAL_VAR records the name; the binding is read once the block
        // finishes. An unknown name is reported rather than silently ending
        // the session.
        if let Some(name) = self.final_name.lock().expect("final marker poisoned").take() {
            let scope = self.scope.lock().expect("scope poisoned");
            match scope.get(&name) {
                Some(value) => match rhai::serde::from_dynamic::<Value>(value) {
                    Ok(json) => result.final_var = Some(json),
                    Err(e) => {
                        result
                            .stderr
                            .push_str(&format!("FINAL_VAR: '{}' is not serializable: {}\n", name, e));
                    }
                },
                None => {
                    result
                        .stderr
                        .push_str(&format!("FINAL_VAR: no variable named '{}'\n", name));
                }
            }
        }

        result
    }

    /// Snapshot the JSON-representable scope bindings. Engine-native values
    /// that do not serialize (closures, iterators) are skipped -- custom
    /// objects are outside the persistence contract.
    pub fn snapshot_state(&self) -> Value {
        let scope = self.scope.lock().expect("scope poisoned");
        let mut state = BTreeMap::new();
        for (name, _constant, value) in scope.iter() {
            if let Ok(json) = rhai::serde::from_dynamic::<Value>(&value) {
                state.insert(name.to_string(), json);
            }
        }
        serde_json::to_value(state).unwrap_or(Value::Null)
    }

    /// Rebind a snapshot taken with [`snapshot_state`](Self::snapshot_state)
    /// into a fresh scope.
    pub fn restore_state(&self, state: &Value) -> crate::error::Result<()> {
        let Some(map) = state.as_object() else {
            return Ok(());
        };
        let mut scope = self.scope.lock().expect("scope poisoned");
        scope.clear();
        for (name, value) in map {
            let dynamic = rhai::serde::to_dynamic(value).map_err(|e| {
                crate::error::RlmError::Sandbox(format!("state value '{}' not bindable: {}", name, e))
            })?;
            scope.push_dynamic(name.clone(), dynamic);
        }
        Ok(())
    }

    /// Drop every binding.
    pub fn clear(&self) {
        self.scope.lock().expect("scope poisoned").clear();
    }
}
