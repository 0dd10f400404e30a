//! Work submission.
//!
//! [`Executor`] is the seam between deferred computations and whatever runs
//! them. [`ContextAwareExecutor`] decorates any executor so submitted tasks
//! run inside the submitter's context.

mod builtin;
mod context_aware;

pub use builtin::{default_executor, InlineExecutor, ThreadExecutor, TokioExecutor};
pub use context_aware::ContextAwareExecutor;

use std::sync::Arc;

/// A unit of work handed to an executor.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks, possibly on other threads.
///
/// An executor that cannot run a task must drop it; stages waiting on the
/// task observe that as a rejection.
pub trait Executor: Send + Sync {
    /// Runs `task` at some point.
    fn execute(&self, task: Task);
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn execute(&self, task: Task) {
        (**self).execute(task);
    }
}

impl<E: Executor + ?Sized> Executor for &E {
    fn execute(&self, task: Task) {
        (**self).execute(task);
    }
}
