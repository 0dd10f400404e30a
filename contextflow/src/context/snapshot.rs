//! Immutable snapshots of all active contexts.

use super::{ContextManager, ContextManagers, ContextValue, Reactivation};
use crate::observability::{ContextOperation, OperationTimer};
use crate::wrappers::{ContextScope, ContextWrapper};
use std::fmt;
use std::sync::Arc;
use tracing::{trace, warn};
use uuid::Uuid;

struct SnapshotEntry {
    manager: Arc<dyn ContextManager>,
    value: Option<ContextValue>,
}

struct SnapshotInner {
    id: Uuid,
    managers: Vec<Arc<dyn ContextManager>>,
    entries: Vec<SnapshotEntry>,
}

/// The captured values of every registered context slot.
///
/// Snapshots are immutable and cheap to clone. The same snapshot may be
/// reactivated any number of times, concurrently, on any thread.
#[derive(Clone)]
pub struct ContextSnapshot {
    inner: Arc<SnapshotInner>,
}

impl ContextSnapshot {
    /// Captures every slot registered with the global registry.
    #[must_use]
    pub fn capture() -> Self {
        ContextManagers::global().capture()
    }

    /// Captures the given managers, in order.
    ///
    /// A manager whose value cannot be read is logged and left out.
    #[must_use]
    pub fn capture_from(managers: &[Arc<dyn ContextManager>]) -> Self {
        let timer = OperationTimer::start(ContextOperation::Capture);
        let mut entries = Vec::with_capacity(managers.len());

        for manager in managers {
            match manager.active_value() {
                Ok(value) => entries.push(SnapshotEntry {
                    manager: manager.clone(),
                    value,
                }),
                Err(err) => {
                    warn!(slot = manager.name(), error = %err, "Failed to capture context, skipping slot");
                    timer.fail(&err);
                }
            }
        }

        let snapshot = Self::from_entries(managers.to_vec(), entries);
        let _ = timer.finish();
        trace!(snapshot_id = %snapshot.id(), slots = snapshot.len(), "Captured context snapshot");
        snapshot
    }

    /// Creates a snapshot that captures nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self::from_entries(Vec::new(), Vec::new())
    }

    fn from_entries(managers: Vec<Arc<dyn ContextManager>>, entries: Vec<SnapshotEntry>) -> Self {
        Self {
            inner: Arc::new(SnapshotInner {
                id: Uuid::new_v4(),
                managers,
                entries,
            }),
        }
    }

    /// Captures the current values of the managers this snapshot was
    /// captured from.
    ///
    /// A snapshot taken from a local [`ContextManagers`] recaptures from that
    /// registry, not the global one.
    #[must_use]
    pub fn recapture(&self) -> Self {
        Self::capture_from(&self.inner.managers)
    }

    /// Returns the diagnostic id of this snapshot.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Returns the number of captured slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    /// Returns true if nothing was captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Returns the captured slot names, in capture order.
    #[must_use]
    pub fn slot_names(&self) -> Vec<&str> {
        self.inner.entries.iter().map(|e| e.manager.name()).collect()
    }

    /// Makes the captured values active on the current thread.
    ///
    /// A slot that fails to activate is logged and skipped; the other slots
    /// are still activated.
    pub fn reactivate(&self) -> Reactivation {
        let timer = OperationTimer::start(ContextOperation::Reactivate);
        let mut active = Vec::with_capacity(self.inner.entries.len());

        for entry in &self.inner.entries {
            match entry.manager.activate(entry.value.clone()) {
                Ok(handle) => active.push((entry.manager.name().to_string(), handle)),
                Err(err) => {
                    warn!(
                        snapshot_id = %self.inner.id,
                        slot = entry.manager.name(),
                        error = %err,
                        "Failed to reactivate context, skipping slot"
                    );
                    timer.fail(&err);
                }
            }
        }

        let _ = timer.finish();
        trace!(snapshot_id = %self.inner.id, slots = active.len(), "Reactivated context snapshot");
        Reactivation::new(self.inner.id, active)
    }

    /// Runs `f` with this snapshot reactivated.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        ContextScope::new(self.clone()).enter(f)
    }

    /// Wraps `delegate` so every invocation runs inside this snapshot.
    #[must_use]
    pub fn wrap<F>(&self, delegate: F) -> ContextWrapper<F> {
        ContextWrapper::new(self.clone(), delegate)
    }
}

impl fmt::Debug for ContextSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextSnapshot")
            .field("id", &self.inner.id)
            .field("slots", &self.slot_names())
            .finish()
    }
}
