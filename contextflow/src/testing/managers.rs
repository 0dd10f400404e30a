//! Context managers for tests.

use crate::context::{ActiveContext, ContextManager, ContextValue};
use crate::errors::ContextflowError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// Calls observed by a [`CountingContextManager`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextCounts {
    /// Reads of the active value.
    pub captures: usize,
    /// Calls to `activate`.
    pub activations: usize,
    /// Closed activation handles.
    pub closes: usize,
    /// Calls to `clear`.
    pub clears: usize,
}

impl ContextCounts {
    fn add(&mut self, other: &Self) {
        self.captures += other.captures;
        self.activations += other.activations;
        self.closes += other.closes;
        self.clears += other.clears;
    }
}

type CountsByThread = Arc<Mutex<HashMap<ThreadId, ContextCounts>>>;

fn record(counts: &CountsByThread, f: impl FnOnce(&mut ContextCounts)) {
    f(counts.lock().entry(thread::current().id()).or_default());
}

/// Wraps another manager and counts the calls made on each thread.
///
/// Counting per thread keeps assertions stable when the manager is registered
/// globally and other threads capture concurrently.
pub struct CountingContextManager {
    inner: Arc<dyn ContextManager>,
    counts: CountsByThread,
}

impl CountingContextManager {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn ContextManager>) -> Self {
        Self {
            inner,
            counts: Arc::default(),
        }
    }

    /// Returns the calls made on the current thread.
    #[must_use]
    pub fn counts(&self) -> ContextCounts {
        self.counts
            .lock()
            .get(&thread::current().id())
            .copied()
            .unwrap_or_default()
    }

    /// Returns the calls made on all threads.
    #[must_use]
    pub fn total(&self) -> ContextCounts {
        let mut total = ContextCounts::default();
        for counts in self.counts.lock().values() {
            total.add(counts);
        }
        total
    }

    /// Forgets all recorded calls.
    pub fn reset(&self) {
        self.counts.lock().clear();
    }
}

impl ContextManager for CountingContextManager {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn active_value(&self) -> Result<Option<ContextValue>, ContextflowError> {
        record(&self.counts, |c| c.captures += 1);
        self.inner.active_value()
    }

    fn activate(
        &self,
        value: Option<ContextValue>,
    ) -> Result<Box<dyn ActiveContext>, ContextflowError> {
        record(&self.counts, |c| c.activations += 1);
        let handle = self.inner.activate(value)?;
        Ok(Box::new(CountingActive {
            inner: handle,
            counts: self.counts.clone(),
        }))
    }

    fn clear(&self) -> Result<(), ContextflowError> {
        record(&self.counts, |c| c.clears += 1);
        self.inner.clear()
    }
}

impl std::fmt::Debug for CountingContextManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountingContextManager")
            .field("name", &self.inner.name())
            .field("total", &self.total())
            .finish()
    }
}

struct CountingActive {
    inner: Box<dyn ActiveContext>,
    counts: CountsByThread,
}

impl ActiveContext for CountingActive {
    fn close(self: Box<Self>) -> Result<(), ContextflowError> {
        record(&self.counts, |c| c.closes += 1);
        self.inner.close()
    }
}

/// A manager that holds no value and fails the operations it is told to.
#[derive(Debug, Clone, Default)]
pub struct FailingContextManager {
    name: String,
    fail_capture: bool,
    fail_activate: bool,
    fail_close: bool,
    fail_clear: bool,
}

impl FailingContextManager {
    /// Creates a manager that fails nothing yet.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Fails every read of the active value.
    #[must_use]
    pub fn fail_on_capture(mut self) -> Self {
        self.fail_capture = true;
        self
    }

    /// Fails every activation.
    #[must_use]
    pub fn fail_on_activate(mut self) -> Self {
        self.fail_activate = true;
        self
    }

    /// Fails closing every activation handle.
    #[must_use]
    pub fn fail_on_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    /// Fails every clear.
    #[must_use]
    pub fn fail_on_clear(mut self) -> Self {
        self.fail_clear = true;
        self
    }

    fn failure(&self, operation: &str) -> ContextflowError {
        ContextflowError::manager(&self.name, format!("{operation} failed"))
    }
}

impl ContextManager for FailingContextManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn active_value(&self) -> Result<Option<ContextValue>, ContextflowError> {
        if self.fail_capture {
            return Err(self.failure("capture"));
        }
        Ok(None)
    }

    fn activate(
        &self,
        _value: Option<ContextValue>,
    ) -> Result<Box<dyn ActiveContext>, ContextflowError> {
        if self.fail_activate {
            return Err(self.failure("activate"));
        }
        Ok(Box::new(FailingActive {
            error: self.fail_close.then(|| self.failure("close")),
        }))
    }

    fn clear(&self) -> Result<(), ContextflowError> {
        if self.fail_clear {
            return Err(self.failure("clear"));
        }
        Ok(())
    }
}

struct FailingActive {
    error: Option<ContextflowError>,
}

impl ActiveContext for FailingActive {
    fn close(self: Box<Self>) -> Result<(), ContextflowError> {
        self.error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextSlot;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_counting_manager_counts_per_thread() {
        let counting = Arc::new(CountingContextManager::new(Arc::new(
            ContextSlot::<String>::new("counted"),
        )));

        counting.active_value().unwrap();
        counting.activate(None).unwrap().close().unwrap();

        let other = counting.clone();
        thread::spawn(move || {
            other.active_value().unwrap();
        })
        .join()
        .unwrap();

        assert_eq!(
            counting.counts(),
            ContextCounts {
                captures: 1,
                activations: 1,
                closes: 1,
                clears: 0,
            }
        );
        assert_eq!(counting.total().captures, 2);

        counting.reset();
        assert_eq!(counting.total(), ContextCounts::default());
    }

    #[test]
    fn test_failing_manager() {
        let manager = FailingContextManager::new("broken").fail_on_close();
        assert!(manager.active_value().unwrap().is_none());
        let handle = manager.activate(None).unwrap();
        assert!(matches!(handle.close(), Err(ContextflowError::Manager { .. })));
        assert!(manager.clear().is_ok());
    }
}
