//! Lifecycle hook bus.
//!
//! A fixed set of hook points brackets each pipeline stage. Handlers run
//! in priority-then-insertion order and may replace the state; a handler
//! that fails or panics is captured into the state's error list and never
//! stops the run.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::Result;
use crate::validate::Score;

/// The fixed hook points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPoint {
    BeforeContext,
    AfterContext,
    BeforeEnhance,
    AfterEnhance,
    BeforeGenerate,
    AfterGenerate,
    BeforeValidate,
    AfterValidate,
    BeforePersist,
    AfterPersist,
    OnError,
}

impl HookPoint {
    pub const ALL: [HookPoint; 11] = [
        HookPoint::BeforeContext,
        HookPoint::AfterContext,
        HookPoint::BeforeEnhance,
        HookPoint::AfterEnhance,
        HookPoint::BeforeGenerate,
        HookPoint::AfterGenerate,
        HookPoint::BeforeValidate,
        HookPoint::AfterValidate,
        HookPoint::BeforePersist,
        HookPoint::AfterPersist,
        HookPoint::OnError,
    ];
}

impl std::fmt::Display for HookPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::BeforeContext => "before_context",
            Self::AfterContext => "after_context",
            Self::BeforeEnhance => "before_enhance",
            Self::AfterEnhance => "after_enhance",
            Self::BeforeGenerate => "before_generate",
            Self::AfterGenerate => "after_generate",
            Self::BeforeValidate => "before_validate",
            Self::AfterValidate => "after_validate",
            Self::BeforePersist => "before_persist",
            Self::AfterPersist => "after_persist",
            Self::OnError => "on_error",
        };
        write!(f, "{}", s)
    }
}

/// A captured handler failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookFailure {
    pub hook: String,
    pub handler: String,
    pub error: String,
}

/// Typed pipeline state threaded through hooks.
///
/// Fields a stage has not reached yet stay unset; handlers may rewrite
/// any of them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookState {
    pub intent: String,
    pub context_block: Option<String>,
    pub enhanced: Option<String>,
    pub html: Option<String>,
    pub score: Option<Score>,
    pub model: Option<String>,
    /// Captured hook failures; never causes the run to fail.
    pub hook_errors: Vec<HookFailure>,
    /// Stage timings in milliseconds, keyed by stage name.
    pub timings: HashMap<String, u64>,
}

impl HookState {
    pub fn for_intent(intent: impl Into<String>) -> Self {
        Self {
            intent: intent.into(),
            ..Default::default()
        }
    }
}

/// A handler: observes the state and may return a replacement. Returning
/// `Ok(None)` leaves the state unchanged.
pub type HookFn = Arc<dyn Fn(&HookState) -> Result<Option<HookState>> + Send + Sync>;

struct Registration {
    name: String,
    priority: i32,
    seq: u64,
    handler: HookFn,
}

/// Priority-ordered, error-isolating hook registry.
#[derive(Default)]
pub struct HookBus {
    handlers: RwLock<HashMap<HookPoint, Vec<Registration>>>,
    seq: AtomicU64,
}

impl HookBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Lower priority runs first; insertion order
    /// breaks ties.
    pub fn register(
        &self,
        point: HookPoint,
        name: impl Into<String>,
        priority: i32,
        handler: HookFn,
    ) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let mut handlers = self.handlers.write().expect("hook registry poisoned");
        let list = handlers.entry(point).or_default();
        list.push(Registration {
            name: name.into(),
            priority,
            seq,
            handler,
        });
        list.sort_by_key(|r| (r.priority, r.seq));
    }

    /// Remove every handler whose name starts with `prefix`.
    pub fn unregister_prefix(&self, prefix: &str) {
        let mut handlers = self.handlers.write().expect("hook registry poisoned");
        for list in handlers.values_mut() {
            list.retain(|r| !r.name.starts_with(prefix));
        }
    }

    /// Number of handlers registered at a point.
    pub fn count(&self, point: HookPoint) -> usize {
        self.handlers
            .read()
            .expect("hook registry poisoned")
            .get(&point)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    /// Run every handler at a point, threading the state through.
    ///
    /// Failures and panics are captured into `state.hook_errors`; after
    /// each capture the `OnError` handlers run (unless the failing point
    /// is itself `OnError`).
    pub fn run(&self, point: HookPoint, mut state: HookState) -> HookState {
        let snapshot: Vec<(String, HookFn)> = {
            let handlers = self.handlers.read().expect("hook registry poisoned");
            handlers
                .get(&point)
                .map(|list| {
                    list.iter()
                        .map(|r| (r.name.clone(), r.handler.clone()))
                        .collect()
                })
                .unwrap_or_default()
        };

        for (name, handler) in snapshot {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(&state)));
            match outcome {
                Ok(Ok(Some(next))) => state = next,
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    tracing::warn!(hook = %point, handler = %name, error = %e, "hook handler failed");
                    state.hook_errors.push(HookFailure {
                        hook: point.to_string(),
                        handler: name,
                        error: e.to_string(),
                    });
                    if point != HookPoint::OnError {
                        state = self.run(HookPoint::OnError, state);
                    }
                }
                Err(_) => {
                    tracing::warn!(hook = %point, handler = %name, "hook handler panicked");
                    state.hook_errors.push(HookFailure {
                        hook: point.to_string(),
                        handler: name,
                        error: "handler panicked".to_string(),
                    });
                    if point != HookPoint::OnError {
                        state = self.run(HookPoint::OnError, state);
                    }
                }
            }
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use pretty_assertions::assert_eq;

    fn appender(tag: &'static str) -> HookFn {
        Arc::new(move |state| {
            let mut next = state.clone();
            let enhanced = next.enhanced.unwrap_or_default();
            next.enhanced = Some(format!("{}{}", enhanced, tag));
            Ok(Some(next))
        })
    }

    #[test]
    fn test_priority_then_insertion_order() {
        let bus = HookBus::new();
        bus.register(HookPoint::BeforeEnhance, "late", 10, appender("c"));
        bus.register(HookPoint::BeforeEnhance, "early", 0, appender("a"));
        bus.register(HookPoint::BeforeEnhance, "early-second", 0, appender("b"));

        let state = bus.run(HookPoint::BeforeEnhance, HookState::for_intent("x"));
        assert_eq!(state.enhanced.as_deref(), Some("abc"));
    }

    #[test]
    fn test_absent_return_leaves_state() {
        let bus = HookBus::new();
        bus.register(
            HookPoint::AfterValidate,
            "observer",
            0,
            Arc::new(|_state| Ok(None)),
        );

        let mut input = HookState::for_intent("x");
        input.html = Some("<html></html>".to_string());
        let state = bus.run(HookPoint::AfterValidate, input.clone());
        assert_eq!(state, input);
    }

    #[test]
    fn test_failing_handler_does_not_stop_later_handlers() {
        let bus = HookBus::new();
        bus.register(
            HookPoint::BeforeGenerate,
            "broken",
            0,
            Arc::new(|_| Err(Error::Internal("boom".into()))),
        );
        bus.register(HookPoint::BeforeGenerate, "after-broken", 1, appender("z"));

        let state = bus.run(HookPoint::BeforeGenerate, HookState::for_intent("x"));
        assert_eq!(state.enhanced.as_deref(), Some("z"));
        assert_eq!(state.hook_errors.len(), 1);
        assert_eq!(state.hook_errors[0].handler, "broken");
        assert_eq!(state.hook_errors[0].hook, "before_generate");
    }

    #[test]
    fn test_panicking_handler_is_captured() {
        let bus = HookBus::new();
        bus.register(
            HookPoint::AfterGenerate,
            "panicky",
            0,
            Arc::new(|_| panic!("unexpected")),
        );
        bus.register(HookPoint::AfterGenerate, "survivor", 1, appender("ok"));

        let state = bus.run(HookPoint::AfterGenerate, HookState::for_intent("x"));
        assert_eq!(state.enhanced.as_deref(), Some("ok"));
        assert_eq!(state.hook_errors[0].error, "handler panicked");
    }

    #[test]
    fn test_on_error_cascade_runs_after_capture() {
        let bus = HookBus::new();
        bus.register(
            HookPoint::BeforeGenerate,
            "broken",
            0,
            Arc::new(|_| Err(Error::Internal("boom".into()))),
        );
        bus.register(
            HookPoint::OnError,
            "error-watcher",
            0,
            Arc::new(|state| {
                let mut next = state.clone();
                next.timings.insert("on_error_ran".to_string(), 1);
                Ok(Some(next))
            }),
        );

        let state = bus.run(HookPoint::BeforeGenerate, HookState::for_intent("x"));
        assert_eq!(state.timings.get("on_error_ran"), Some(&1));
    }

    #[test]
    fn test_failing_on_error_does_not_recurse() {
        let bus = HookBus::new();
        bus.register(
            HookPoint::OnError,
            "broken-error-hook",
            0,
            Arc::new(|_| Err(Error::Internal("nested".into()))),
        );

        let state = bus.run(HookPoint::OnError, HookState::for_intent("x"));
        // Captured once, no cascade back into on_error.
        assert_eq!(state.hook_errors.len(), 1);
    }

    #[test]
    fn test_unregister_prefix_removes_plugin_bundle() {
        let bus = HookBus::new();
        bus.register(HookPoint::BeforeEnhance, "themer:inject", 0, appender("a"));
        bus.register(HookPoint::AfterValidate, "themer:report", 0, appender("b"));
        bus.register(HookPoint::BeforeEnhance, "other:keep", 0, appender("c"));

        bus.unregister_prefix("themer:");
        assert_eq!(bus.count(HookPoint::BeforeEnhance), 1);
        assert_eq!(bus.count(HookPoint::AfterValidate), 0);
    }
}
