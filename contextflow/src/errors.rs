//! Error types for the contextflow crate.
//!
//! Context propagation never invents its own failure channel: construction
//! mistakes are returned from builders, restore failures are aggregated per
//! reactivation, and stage failures travel through [`CompletionError`].

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// The main error type for context propagation.
#[derive(Debug, Clone, Error)]
pub enum ContextflowError {
    /// A wrapper or stage was built without any way to obtain a snapshot.
    #[error("No context snapshot or snapshot supplier provided for {target}")]
    MissingSnapshot {
        /// What was being constructed.
        target: String,
    },

    /// A required argument was not provided.
    #[error("Missing required argument: {argument}")]
    NullArgument {
        /// The argument name.
        argument: String,
    },

    /// Restoring the previous context failed for one or more slots.
    #[error("{0}")]
    Restore(#[from] RestoreError),

    /// A context manager failed to read, install or clear a value.
    #[error("Context manager '{manager}' failed: {message}")]
    Manager {
        /// The manager name.
        manager: String,
        /// What went wrong.
        message: String,
    },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ContextflowError {
    /// Creates a missing snapshot error.
    #[must_use]
    pub fn missing_snapshot(target: impl Into<String>) -> Self {
        Self::MissingSnapshot {
            target: target.into(),
        }
    }

    /// Creates a missing argument error.
    #[must_use]
    pub fn null_argument(argument: impl Into<String>) -> Self {
        Self::NullArgument {
            argument: argument.into(),
        }
    }

    /// Creates a manager failure.
    #[must_use]
    pub fn manager(manager: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Manager {
            manager: manager.into(),
            message: message.into(),
        }
    }
}

/// A single slot that could not be restored.
#[derive(Debug, Clone)]
pub struct SlotFailure {
    /// The slot (context manager) name.
    pub slot: String,
    /// The underlying failure.
    pub error: Box<ContextflowError>,
}

impl fmt::Display for SlotFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.slot, self.error)
    }
}

/// Aggregated failure from closing a reactivation.
///
/// Every slot is attempted; each failing slot is recorded in order.
#[derive(Debug, Clone, Default, Error)]
#[error("Failed to restore {} context slot(s): {}", .failures.len(), describe(.failures))]
pub struct RestoreError {
    /// The slots that failed, in the order they were closed.
    pub failures: Vec<SlotFailure>,
}

fn describe(failures: &[SlotFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl RestoreError {
    /// Creates an empty restore error.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failing slot.
    pub fn push(&mut self, slot: impl Into<String>, error: ContextflowError) {
        self.failures.push(SlotFailure {
            slot: slot.into(),
            error: Box::new(error),
        });
    }

    /// Returns true if no slot failed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Converts into `Ok(())` when nothing failed.
    pub fn into_result(self) -> Result<(), ContextflowError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(ContextflowError::Restore(self))
        }
    }
}

/// The reason a [`Completable`](crate::completion::Completable) finished without a value.
#[derive(Debug, Clone, Error)]
pub enum CompletionError {
    /// The computation returned an error.
    #[error("{0}")]
    Failed(Arc<dyn std::error::Error + Send + Sync + 'static>),

    /// The computation panicked.
    #[error("Computation panicked: {0}")]
    Panicked(String),

    /// The stage was cancelled before completing.
    #[error("Computation was cancelled")]
    Cancelled,

    /// Waiting for the outcome timed out.
    #[error("Timed out waiting for completion")]
    TimedOut,

    /// The executor dropped the task without running it.
    #[error("Task was rejected by executor: {0}")]
    Rejected(String),
}

impl CompletionError {
    /// Wraps any error as a failure.
    #[must_use]
    pub fn failed(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Failed(Arc::new(error))
    }

    /// Wraps an `anyhow` error as a failure.
    #[must_use]
    pub fn from_anyhow(error: anyhow::Error) -> Self {
        let boxed: Box<dyn std::error::Error + Send + Sync + 'static> = error.into();
        Self::Failed(Arc::from(boxed))
    }

    /// Builds a failure from a caught panic payload.
    #[must_use]
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "<non-string panic payload>".to_string());
        Self::Panicked(message)
    }

    /// Returns the failure downcast to a concrete error type, if it is one.
    #[must_use]
    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            Self::Failed(error) => error.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Returns true if this is a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<ContextflowError> for CompletionError {
    fn from(error: ContextflowError) -> Self {
        Self::failed(error)
    }
}

impl From<TaskError> for CompletionError {
    fn from(error: TaskError) -> Self {
        Self::failed(error)
    }
}

/// A task failure with restore failures attached as suppressed causes.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct TaskError {
    /// The task's own failure; always takes precedence.
    pub error: anyhow::Error,
    /// Failures that happened while restoring the submitting context.
    pub suppressed: Vec<ContextflowError>,
}

impl TaskError {
    /// Creates a task error without suppressed causes.
    #[must_use]
    pub fn new(error: anyhow::Error) -> Self {
        Self {
            error,
            suppressed: Vec::new(),
        }
    }

    /// Attaches a suppressed failure.
    #[must_use]
    pub fn with_suppressed(mut self, error: ContextflowError) -> Self {
        self.suppressed.push(error);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_snapshot_message() {
        let err = ContextflowError::missing_snapshot("ContextWrapper");
        assert_eq!(
            err.to_string(),
            "No context snapshot or snapshot supplier provided for ContextWrapper"
        );
    }

    #[test]
    fn test_restore_error_aggregates() {
        let mut err = RestoreError::new();
        assert!(err.is_empty());
        err.push("first", ContextflowError::manager("first", "gone"));
        err.push("second", ContextflowError::manager("second", "closed"));

        let message = err.to_string();
        assert!(message.contains("2 context slot(s)"));
        assert!(message.contains("first: Context manager 'first' failed: gone"));
        assert!(message.contains("second"));
        assert!(matches!(err.into_result(), Err(ContextflowError::Restore(_))));
    }

    #[test]
    fn test_empty_restore_error_is_ok() {
        assert!(RestoreError::new().into_result().is_ok());
    }

    #[test]
    fn test_completion_error_downcast() {
        let err = CompletionError::from(ContextflowError::null_argument("delegate"));
        let inner = err.downcast_ref::<ContextflowError>();
        assert!(matches!(inner, Some(ContextflowError::NullArgument { .. })));
        assert!(!err.is_cancelled());
    }

    #[test]
    fn test_completion_error_from_panic() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        let err = CompletionError::from_panic(payload.as_ref());
        assert_eq!(err.to_string(), "Computation panicked: boom");
    }

    #[test]
    fn test_task_error_keeps_primary() {
        let err = TaskError::new(anyhow::anyhow!("task failed"))
            .with_suppressed(ContextflowError::manager("slot", "restore failed"));
        assert_eq!(err.to_string(), "task failed");
        assert_eq!(err.suppressed.len(), 1);
    }
}
