// src/concurrency/item.rs

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use super::context::{self, ExecutionContext};
use crate::types::Id;

type Job = Box<dyn FnOnce() -> std::result::Result<(), String> + Send + 'static>;

/// Why a callback did not complete normally
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ItemFailure {
    #[error("work item panicked: {0}")]
    Panicked(String),
    #[error("work item failed: {0}")]
    Failed(String),
}

/// A deferred invocation of a callback with its argument.
///
/// The callback runs exactly once on whichever worker dequeues the item.
pub struct WorkItem {
    id: Id,
    job: Job,
    context: Option<Arc<ExecutionContext>>,
    submitted_at: Instant,
}

impl WorkItem {
    pub fn new<F, A>(callback: F, argument: A) -> Self
    where
        F: FnOnce(A) + Send + 'static,
        A: Send + 'static,
    {
        Self::from_job(Box::new(move || {
            callback(argument);
            Ok(())
        }))
    }

    /// A callback whose `Err` is counted as a failure just like a panic
    pub fn fallible<F, A, E>(callback: F, argument: A) -> Self
    where
        F: FnOnce(A) -> std::result::Result<(), E> + Send + 'static,
        A: Send + 'static,
        E: fmt::Display,
    {
        Self::from_job(Box::new(move || {
            callback(argument).map_err(|e| e.to_string())
        }))
    }

    fn from_job(job: Job) -> Self {
        Self {
            id: Uuid::new_v4(),
            job,
            context: None,
            submitted_at: Instant::now(),
        }
    }

    /// Attaches the ambient context restored around the callback
    pub fn with_context(mut self, context: Arc<ExecutionContext>) -> Self {
        self.context = Some(context);
        self
    }

    pub(crate) fn with_optional_context(mut self, context: Option<Arc<ExecutionContext>>) -> Self {
        self.context = context;
        self
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn context(&self) -> Option<&Arc<ExecutionContext>> {
        self.context.as_ref()
    }

    /// Time spent waiting in the queue so far
    pub fn queued_for(&self) -> Duration {
        self.submitted_at.elapsed()
    }

    /// Runs the callback inside a failure boundary.
    ///
    /// The captured context is installed for the duration of the call and
    /// cleared afterwards, even when the callback unwinds.
    pub fn run(self) -> std::result::Result<(), ItemFailure> {
        let Self { job, context, .. } = self;

        match context {
            Some(context) => {
                let span = context.span();
                let _entered = span.enter();
                let _guard = context::enter(context);
                guarded(job)
            }
            None => guarded(job),
        }
    }
}

fn guarded(job: Job) -> std::result::Result<(), ItemFailure> {
    match catch_unwind(AssertUnwindSafe(job)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(message)) => Err(ItemFailure::Failed(message)),
        Err(payload) => Err(ItemFailure::Panicked(panic_message(payload))),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("id", &self.id)
            .field("job", &"<FnOnce>")
            .field("context", &self.context.as_ref().map(|c| c.correlation_id()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_callback_receives_argument() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);

        let item = WorkItem::new(move |n: usize| { seen_clone.store(n, Ordering::SeqCst); }, 41);
        assert!(item.run().is_ok());
        assert_eq!(seen.load(Ordering::SeqCst), 41);
    }

    #[test]
    fn test_divide_by_zero_is_captured() {
        let item = WorkItem::new(|divisor: i32| {
            let _ = 10 / divisor;
        }, 0);

        match item.run() {
            Err(ItemFailure::Panicked(message)) => assert!(message.contains("divide by zero")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_fallible_error_is_failure() {
        let item = WorkItem::fallible(|path: &'static str| Err(format!("{} not found", path)), "a.txt");
        assert_eq!(item.run(), Err(ItemFailure::Failed("a.txt not found".to_string())));
    }

    #[test]
    fn test_context_visible_only_during_callback() {
        let context = Arc::new(ExecutionContext::new().with_principal("svc-batch"));
        let observed = Arc::new(parking_lot::Mutex::new(None));
        let observed_clone = Arc::clone(&observed);

        let item = WorkItem::new(move |_: ()| {
            *observed_clone.lock() = context::current().and_then(|c| c.principal().map(str::to_string));
        }, ())
        .with_context(context);

        item.run().unwrap();
        assert_eq!(observed.lock().as_deref(), Some("svc-batch"));
        assert!(context::current().is_none());
    }

    #[test]
    fn test_context_cleared_after_panic() {
        let item = WorkItem::new(|_: ()| panic!("bad input"), ())
            .with_context(Arc::new(ExecutionContext::new()));

        assert_eq!(item.run(), Err(ItemFailure::Panicked("bad input".to_string())));
        assert!(context::current().is_none());
    }
}
