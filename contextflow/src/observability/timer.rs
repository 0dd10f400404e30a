//! Context timers and the global timer registry.

use crate::config::config;
use crate::errors::ContextflowError;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// The kind of operation being timed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextOperation {
    /// Capturing a snapshot of all active contexts.
    Capture,
    /// Reactivating a snapshot.
    Reactivate,
    /// Closing a reactivation.
    Close,
    /// Clearing all active contexts on the current thread.
    Clear,
}

impl ContextOperation {
    /// Returns the stable name used in logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Capture => "ContextSnapshot.capture",
            Self::Reactivate => "ContextSnapshot.reactivate",
            Self::Close => "Reactivation.close",
            Self::Clear => "ContextManagers.clear_active_contexts",
        }
    }
}

impl fmt::Display for ContextOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives timing and error signals for context operations.
pub trait ContextTimer: Send + Sync {
    /// Records how long an operation took.
    fn update(&self, operation: ContextOperation, duration: Duration);

    /// Records that an operation failed.
    fn on_error(&self, _operation: ContextOperation, _error: &ContextflowError) {}
}

/// A timer that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpContextTimer;

impl ContextTimer for NoOpContextTimer {
    fn update(&self, _operation: ContextOperation, _duration: Duration) {}
}

/// A timer that logs through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingContextTimer;

impl ContextTimer for LoggingContextTimer {
    fn update(&self, operation: ContextOperation, duration: Duration) {
        debug!(
            operation = operation.as_str(),
            duration_ms = duration.as_secs_f64() * 1000.0,
            "Context operation timed"
        );
    }

    fn on_error(&self, operation: ContextOperation, err: &ContextflowError) {
        error!(operation = operation.as_str(), error = %err, "Context operation failed");
    }
}

static GLOBAL_CONTEXT_TIMER: RwLock<Option<Arc<dyn ContextTimer>>> = RwLock::new(None);

/// Sets the process-wide context timer.
pub fn set_context_timer(timer: Arc<dyn ContextTimer>) {
    *GLOBAL_CONTEXT_TIMER.write() = Some(timer);
}

/// Clears the process-wide context timer.
pub fn clear_context_timer() {
    *GLOBAL_CONTEXT_TIMER.write() = None;
}

/// Gets the process-wide context timer.
///
/// Returns a `NoOpContextTimer` if none is set.
pub fn context_timer() -> Arc<dyn ContextTimer> {
    GLOBAL_CONTEXT_TIMER
        .read()
        .clone()
        .unwrap_or_else(|| Arc::new(NoOpContextTimer))
}

/// Times one operation and reports it to the global timer on `finish`.
#[derive(Debug)]
pub struct OperationTimer {
    operation: ContextOperation,
    start: Option<Instant>,
}

impl OperationTimer {
    /// Starts timing, unless timing is disabled in the configuration.
    #[must_use]
    pub fn start(operation: ContextOperation) -> Self {
        let start = config().timing_enabled.then(Instant::now);
        Self { operation, start }
    }

    /// Returns the operation being timed.
    #[must_use]
    pub fn operation(&self) -> ContextOperation {
        self.operation
    }

    /// Stops timing and reports the duration, if timing was enabled.
    pub fn finish(self) -> Option<Duration> {
        let duration = self.start?.elapsed();
        let threshold = config().slow_operation_threshold();
        if duration > threshold {
            warn!(
                operation = self.operation.as_str(),
                duration_ms = duration.as_secs_f64() * 1000.0,
                threshold_ms = threshold.as_secs_f64() * 1000.0,
                "Slow context operation"
            );
        }
        context_timer().update(self.operation, duration);
        Some(duration)
    }

    /// Reports a failure of the timed operation.
    pub fn fail(&self, err: &ContextflowError) {
        context_timer().on_error(self.operation, err);
    }
}
