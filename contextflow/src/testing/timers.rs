//! A context timer that records what it receives.

use crate::errors::ContextflowError;
use crate::observability::{ContextOperation, ContextTimer};
use parking_lot::Mutex;
use std::thread::{self, ThreadId};
use std::time::Duration;

/// One signal received by a [`CollectingContextTimer`].
#[derive(Debug, Clone, PartialEq)]
pub struct TimerEvent {
    /// The thread that reported the signal.
    pub thread: ThreadId,
    /// The timed operation.
    pub operation: ContextOperation,
    /// The duration, for timing signals.
    pub duration: Option<Duration>,
    /// The error message, for failure signals.
    pub error: Option<String>,
}

/// Records every timing and failure signal.
#[derive(Debug, Default)]
pub struct CollectingContextTimer {
    events: Mutex<Vec<TimerEvent>>,
}

impl CollectingContextTimer {
    /// Creates an empty timer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every recorded event.
    #[must_use]
    pub fn events(&self) -> Vec<TimerEvent> {
        self.events.lock().clone()
    }

    /// Returns the events reported from the current thread.
    #[must_use]
    pub fn events_on_current_thread(&self) -> Vec<TimerEvent> {
        let current = thread::current().id();
        self.events
            .lock()
            .iter()
            .filter(|event| event.thread == current)
            .cloned()
            .collect()
    }

    /// Returns the timed operations reported from the current thread.
    #[must_use]
    pub fn timed_operations(&self) -> Vec<ContextOperation> {
        self.events_on_current_thread()
            .into_iter()
            .filter(|event| event.duration.is_some())
            .map(|event| event.operation)
            .collect()
    }

    /// Returns the failures reported from the current thread.
    #[must_use]
    pub fn errors(&self) -> Vec<(ContextOperation, String)> {
        self.events_on_current_thread()
            .into_iter()
            .filter_map(|event| event.error.map(|error| (event.operation, error)))
            .collect()
    }

    /// Forgets all recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl ContextTimer for CollectingContextTimer {
    fn update(&self, operation: ContextOperation, duration: Duration) {
        self.events.lock().push(TimerEvent {
            thread: thread::current().id(),
            operation,
            duration: Some(duration),
            error: None,
        });
    }

    fn on_error(&self, operation: ContextOperation, error: &ContextflowError) {
        self.events.lock().push(TimerEvent {
            thread: thread::current().id(),
            operation,
            duration: None,
            error: Some(error.to_string()),
        });
    }
}
