//! Stock executors.

use super::{Executor, Task};
use crate::config::config;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{error, trace};

/// Runs every task on a new named thread.
#[derive(Debug, Clone, Default)]
pub struct ThreadExecutor {
    thread_name: Option<String>,
}

impl ThreadExecutor {
    /// Creates an executor naming its threads after the configured worker name.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the thread name.
    #[must_use]
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = Some(name.into());
        self
    }
}

impl Executor for ThreadExecutor {
    fn execute(&self, task: Task) {
        let name = self
            .thread_name
            .clone()
            .unwrap_or_else(|| config().worker_thread_name.clone());
        // The task is dropped if the thread cannot be spawned.
        if let Err(err) = std::thread::Builder::new().name(name.clone()).spawn(task) {
            error!(thread = %name, error = %err, "Failed to spawn worker thread");
        }
    }
}

/// Runs tasks on a tokio runtime's blocking pool.
#[derive(Debug, Clone)]
pub struct TokioExecutor {
    handle: Handle,
}

impl TokioExecutor {
    /// Creates an executor for the given runtime.
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Creates an executor for the runtime of the current task, if any.
    #[must_use]
    pub fn try_current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, task: Task) {
        trace!("Submitting task to tokio blocking pool");
        drop(self.handle.spawn_blocking(task));
    }
}

/// Runs tasks immediately on the submitting thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, task: Task) {
        task();
    }
}

/// Returns the executor used when none is given: a [`ThreadExecutor`].
#[must_use]
pub fn default_executor() -> Arc<dyn Executor> {
    Arc::new(ThreadExecutor::new())
}
