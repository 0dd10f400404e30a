//! Executor decorator that runs tasks in the submitter's context.

use super::{Executor, Task};
use crate::completion::{dispatch, Completable};
use crate::context::ContextSnapshot;
use crate::errors::{CompletionError, TaskError};
use crate::wrappers::ContextScope;
use tracing::{trace, warn};

/// Runs every task inside the context captured on the submitting thread.
///
/// ```
/// use contextflow::prelude::*;
///
/// let request = ContextSlot::<String>::register("request-id");
/// let _guard = request.set("req-42".to_string());
///
/// let executor = ContextAwareExecutor::new(ThreadExecutor::new());
/// let seen = {
///     let request = request.clone();
///     executor.submit_fn(move || request.get_cloned())
/// };
/// assert_eq!(seen.join().unwrap().as_deref(), Some("req-42"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ContextAwareExecutor<E> {
    inner: E,
}

impl<E: Executor> ContextAwareExecutor<E> {
    /// Decorates `inner`.
    #[must_use]
    pub fn new(inner: E) -> Self {
        Self { inner }
    }

    /// The decorated executor.
    pub fn inner(&self) -> &E {
        &self.inner
    }

    /// Unwraps the decorated executor.
    pub fn into_inner(self) -> E {
        self.inner
    }

    /// Submits a fallible task and returns a stage for its result.
    ///
    /// A failure to restore the worker's context fails the stage when the
    /// task itself succeeded. When both fail the task's error wins and the
    /// restore failure is attached to it as a suppressed cause.
    pub fn submit<T, F>(&self, f: F) -> Completable<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        self.submit_in(ContextScope::new(ContextSnapshot::capture()), f)
    }

    fn submit_in<T, F>(&self, scope: ContextScope, f: F) -> Completable<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let stage = Completable::new();
        dispatch(&self.inner, stage.clone(), move || {
            match scope.run_and_close(f) {
                (Ok(value), Ok(())) => Ok(value),
                (Ok(_), Err(close_err)) => Err(CompletionError::from(close_err)),
                (Err(err), Ok(())) => Err(TaskError::new(err).into()),
                (Err(err), Err(close_err)) => {
                    warn!(error = %close_err, "Suppressed context restore failure after failed task");
                    Err(TaskError::new(err).with_suppressed(close_err).into())
                }
            }
        });
        stage
    }

    /// Submits an infallible task and returns a stage for its result.
    ///
    /// A failure to restore the worker's context fails the stage.
    pub fn submit_fn<T, F>(&self, f: F) -> Completable<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let scope = ContextScope::new(ContextSnapshot::capture());
        let stage = Completable::new();
        dispatch(&self.inner, stage.clone(), move || {
            let (value, closed) = scope.run_and_close(f);
            closed.map(|()| value).map_err(CompletionError::from)
        });
        stage
    }
}

impl<E: Executor> Executor for ContextAwareExecutor<E> {
    fn execute(&self, task: Task) {
        let scope = ContextScope::new(ContextSnapshot::capture());
        trace!(snapshot_id = %scope.source().snapshot().id(), "Submitting context-aware task");
        self.inner.execute(Box::new(move || scope.enter(task)));
    }
}
