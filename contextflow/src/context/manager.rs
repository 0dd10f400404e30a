//! The context manager SPI and the ordered manager registry.

use super::ContextSnapshot;
use crate::errors::{ContextflowError, RestoreError};
use crate::observability::{ContextOperation, OperationTimer};
use parking_lot::RwLock;
use std::any::Any;
use std::sync::Arc;
use tracing::{debug, warn};

/// A type-erased context value as stored in a snapshot.
pub type ContextValue = Arc<dyn Any + Send + Sync>;

/// Manages one independent piece of thread-scoped context.
///
/// Implementations keep the active value per thread; capturing reads it,
/// reactivating installs a captured value on whatever thread calls
/// [`ContextManager::activate`].
pub trait ContextManager: Send + Sync {
    /// Returns the manager name used in logs and errors.
    fn name(&self) -> &str;

    /// Reads the value active on the current thread.
    fn active_value(&self) -> Result<Option<ContextValue>, ContextflowError>;

    /// Installs `value` as active on the current thread.
    ///
    /// Closing the returned handle restores whatever was active before.
    fn activate(&self, value: Option<ContextValue>)
        -> Result<Box<dyn ActiveContext>, ContextflowError>;

    /// Clears the value active on the current thread.
    fn clear(&self) -> Result<(), ContextflowError>;
}

/// Undo handle for one [`ContextManager::activate`] call.
pub trait ActiveContext {
    /// Restores the value that was active before activation.
    fn close(self: Box<Self>) -> Result<(), ContextflowError>;
}

/// An ordered registry of context managers.
///
/// Snapshots capture managers in registration order and restore them in
/// reverse order.
#[derive(Default)]
pub struct ContextManagers {
    managers: RwLock<Vec<Arc<dyn ContextManager>>>,
}

static GLOBAL_MANAGERS: ContextManagers = ContextManagers::new();

impl ContextManagers {
    /// Creates an empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            managers: RwLock::new(Vec::new()),
        }
    }

    /// Returns the process-wide registry used by [`ContextSnapshot::capture`].
    #[must_use]
    pub fn global() -> &'static Self {
        &GLOBAL_MANAGERS
    }

    /// Registers a manager.
    ///
    /// Returns false if this exact manager was already registered.
    pub fn register(&self, manager: Arc<dyn ContextManager>) -> bool {
        let mut managers = self.managers.write();
        if managers.iter().any(|m| same_manager(m, &manager)) {
            return false;
        }
        debug!(manager = manager.name(), "Registered context manager");
        managers.push(manager);
        true
    }

    /// Unregisters a manager.
    ///
    /// Returns true if it was registered.
    pub fn unregister(&self, manager: &Arc<dyn ContextManager>) -> bool {
        let mut managers = self.managers.write();
        let initial_len = managers.len();
        managers.retain(|m| !same_manager(m, manager));
        managers.len() < initial_len
    }

    /// Returns the registered managers in registration order.
    #[must_use]
    pub fn managers(&self) -> Vec<Arc<dyn ContextManager>> {
        self.managers.read().clone()
    }

    /// Returns the number of registered managers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.managers.read().len()
    }

    /// Returns true if no managers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.managers.read().is_empty()
    }

    /// Captures the active value of every registered manager.
    #[must_use]
    pub fn capture(&self) -> ContextSnapshot {
        ContextSnapshot::capture_from(&self.managers())
    }

    /// Clears every registered context on the current thread.
    ///
    /// Every manager is attempted; failures are aggregated.
    pub fn clear_active_contexts(&self) -> Result<(), ContextflowError> {
        let timer = OperationTimer::start(ContextOperation::Clear);
        let mut failures = RestoreError::new();
        for manager in self.managers() {
            if let Err(err) = manager.clear() {
                warn!(manager = manager.name(), error = %err, "Failed to clear active context");
                failures.push(manager.name(), err);
            }
        }
        let result = failures.into_result();
        if let Err(ref err) = result {
            timer.fail(err);
        }
        let _ = timer.finish();
        result
    }
}

impl std::fmt::Debug for ContextManagers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .managers
            .read()
            .iter()
            .map(|m| m.name().to_string())
            .collect();
        f.debug_struct("ContextManagers")
            .field("managers", &names)
            .finish()
    }
}

fn same_manager(a: &Arc<dyn ContextManager>, b: &Arc<dyn ContextManager>) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}
