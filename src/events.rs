//! Event system for session lifecycle hooks.
//!
//! Provides an optional, non-intrusive way to observe a running session.
//! The REPL loop emits events as iterations start, code blocks run, and
//! sub-LM calls complete. Embedders implement [`EventHandler`] to receive
//! them for progress display or custom logging.

use std::sync::Arc;
use uuid::Uuid;

/// Events emitted during session execution.
#[derive(Debug, Clone)]
pub enum Event {
    /// A session has started.
    SessionStart {
        session_id: String,
    },
    /// An iteration (one outer-LM turn) is beginning.
    IterationStart {
        session_id: String,
        /// 0-based iteration index.
        index: u32,
    },
    /// A code block is about to execute.
    CodeBlockStart {
        session_id: String,
        iteration: u32,
        /// 0-based position within the outer response.
        block: usize,
    },
    /// A code block finished.
    CodeBlockEnd {
        session_id: String,
        iteration: u32,
        block: usize,
        /// Whether execution succeeded.
        ok: bool,
    },
    /// A recursive sub-LM call completed inside the sandbox.
    SubLmCall {
        session_id: String,
        request_id: Uuid,
        depth: u32,
    },
    /// The session finished.
    SessionEnd {
        session_id: String,
        /// Terminal stop reason (`"final_answer"`, `"iteration_budget"`, …).
        stop_reason: String,
    },
}

/// Handler for session lifecycle events.
///
/// Entirely optional -- the loop runs without one.
pub trait EventHandler: Send + Sync {
    /// Called when the session emits an event.
    fn on_event(&self, event: Event);
}

/// Emit an event if a handler is present. No-op otherwise.
pub(crate) fn emit(handler: &Option<Arc<dyn EventHandler>>, event: Event) {
    if let Some(ref h) = handler {
        h.on_event(event);
    }
}

/// An [`EventHandler`] backed by a closure.
///
/// # Example
///
/// ```
/// use rlm_runtime::events::{Event, FnEventHandler};
/// use std::sync::Arc;
///
/// let handler = Arc::new(FnEventHandler(|event: Event| {
///     if let Event::IterationStart { index, .. } = event {
///         eprintln!("iteration {}", index);
///     }
/// }));
/// ```
pub struct FnEventHandler<F: Fn(Event) + Send + Sync>(pub F);

impl<F: Fn(Event) + Send + Sync> EventHandler for FnEventHandler<F> {
    fn on_event(&self, event: Event) {
        (self.0)(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_fn_handler_receives_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler: Option<Arc<dyn EventHandler>> = Some(Arc::new(FnEventHandler({
            let seen = Arc::clone(&seen);
            move |event: Event| {
                if let Event::IterationStart { index, .. } = event {
                    seen.lock().unwrap().push(index);
                }
            }
        })));

        emit(
            &handler,
            Event::IterationStart {
                session_id: "s".into(),
                index: 3,
            },
        );
        assert_eq!(*seen.lock().unwrap(), vec![3]);
    }

    #[test]
    fn test_emit_without_handler_is_noop() {
        emit(
            &None,
            Event::SessionStart {
                session_id: "s".into(),
            },
        );
    }
}
