//! Attempt lifecycle hooks.
//!
//! Observer interface fired at attempt create/submit/complete/fail.
//! Hooks must never block engine progress: the composite dispatcher
//! isolates every call, catching panics and logging them.

use std::panic::{catch_unwind, AssertUnwindSafe};

/// Identifiers passed to every hook invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptContext {
    pub run_id: String,
    pub task_id: String,
    pub attempt_id: String,
    pub operator_key: Option<String>,
    /// 1-based index of this attempt within its task.
    pub attempt_index: i64,
}

/// Observer for attempt lifecycle events. All methods default to no-ops
/// so implementors override only what they care about.
pub trait LifecycleHook: Send + Sync {
    /// After the attempt row is created, before `prepare` runs.
    fn on_create(&self, _context: &AttemptContext) {}

    /// After `submit` succeeds.
    fn on_submit(&self, _context: &AttemptContext, _external_id: Option<&str>) {}

    /// When polling observes a terminal COMPLETED.
    fn on_complete(&self, _context: &AttemptContext, _success: bool) {}

    /// On dispatch failure, poll-observed FAILED, or orphan cleanup.
    fn on_fail(&self, _context: &AttemptContext, _error: &str) {}
}

/// Call one hook method, swallowing panics so a misbehaving plugin can
/// never stall the tick.
fn isolate(hook_name: &str, context: &AttemptContext, f: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "<non-string panic>".to_string());
        tracing::warn!(
            hook = hook_name,
            attempt_id = %context.attempt_id,
            panic = %message,
            "lifecycle hook panicked; continuing"
        );
    }
}

/// Chains hooks together with per-hook error isolation.
#[derive(Default)]
pub struct CompositeHook {
    hooks: Vec<Box<dyn LifecycleHook>>,
}

impl CompositeHook {
    pub fn new(hooks: Vec<Box<dyn LifecycleHook>>) -> Self {
        Self { hooks }
    }

    pub fn push(&mut self, hook: Box<dyn LifecycleHook>) {
        self.hooks.push(hook);
    }
}

impl LifecycleHook for CompositeHook {
    fn on_create(&self, context: &AttemptContext) {
        for hook in &self.hooks {
            isolate("on_create", context, || hook.on_create(context));
        }
    }

    fn on_submit(&self, context: &AttemptContext, external_id: Option<&str>) {
        for hook in &self.hooks {
            isolate("on_submit", context, || hook.on_submit(context, external_id));
        }
    }

    fn on_complete(&self, context: &AttemptContext, success: bool) {
        for hook in &self.hooks {
            isolate("on_complete", context, || hook.on_complete(context, success));
        }
    }

    fn on_fail(&self, context: &AttemptContext, error: &str) {
        for hook in &self.hooks {
            isolate("on_fail", context, || hook.on_fail(context, error));
        }
    }
}

/// Built-in hook that logs lifecycle events through `tracing`.
#[derive(Debug, Default)]
pub struct LoggingHook;

impl LifecycleHook for LoggingHook {
    fn on_create(&self, context: &AttemptContext) {
        tracing::info!(
            attempt_id = %context.attempt_id,
            task_id = %context.task_id,
            run_id = %context.run_id,
            operator_key = context.operator_key.as_deref().unwrap_or(""),
            attempt_index = context.attempt_index,
            "attempt created"
        );
    }

    fn on_submit(&self, context: &AttemptContext, external_id: Option<&str>) {
        tracing::info!(
            attempt_id = %context.attempt_id,
            task_id = %context.task_id,
            external_id = external_id.unwrap_or(""),
            "attempt submitted"
        );
    }

    fn on_complete(&self, context: &AttemptContext, success: bool) {
        tracing::info!(
            attempt_id = %context.attempt_id,
            task_id = %context.task_id,
            success,
            "attempt completed"
        );
    }

    fn on_fail(&self, context: &AttemptContext, error: &str) {
        tracing::error!(
            attempt_id = %context.attempt_id,
            task_id = %context.task_id,
            error,
            "attempt failed"
        );
    }
}

/// A hook that does nothing, for callers without observers.
#[derive(Debug, Default)]
pub struct NoopHook;

impl LifecycleHook for NoopHook {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn context() -> AttemptContext {
        AttemptContext {
            run_id: "r".to_string(),
            task_id: "t".to_string(),
            attempt_id: "a".to_string(),
            operator_key: Some("hpc.default".to_string()),
            attempt_index: 1,
        }
    }

    struct CountingHook {
        calls: Arc<AtomicUsize>,
    }

    impl LifecycleHook for CountingHook {
        fn on_create(&self, _context: &AttemptContext) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }

        fn on_fail(&self, _context: &AttemptContext, _error: &str) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PanickingHook;

    impl LifecycleHook for PanickingHook {
        fn on_create(&self, _context: &AttemptContext) {
            panic!("hook exploded");
        }
    }

    #[test]
    fn panicking_hook_does_not_stop_later_hooks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let composite = CompositeHook::new(vec![
            Box::new(PanickingHook),
            Box::new(CountingHook {
                calls: Arc::clone(&calls),
            }),
        ]);

        composite.on_create(&context());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn all_hooks_receive_events() {
        let calls = Arc::new(AtomicUsize::new(0));
        let composite = CompositeHook::new(vec![
            Box::new(CountingHook {
                calls: Arc::clone(&calls),
            }),
            Box::new(CountingHook {
                calls: Arc::clone(&calls),
            }),
        ]);

        composite.on_create(&context());
        composite.on_fail(&context(), "boom");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn default_methods_are_noops() {
        let hook = NoopHook;
        hook.on_create(&context());
        hook.on_submit(&context(), Some("job-1"));
        hook.on_complete(&context(), true);
        hook.on_fail(&context(), "err");
    }
}
