//! A mutable cell carrying the snapshot between chained stages.

use super::ContextSnapshot;
use parking_lot::RwLock;
use std::fmt;
use tracing::trace;

/// Supplies the snapshot to reactivate at invocation time.
pub trait SnapshotSupplier: Send + Sync {
    /// Returns the current snapshot.
    fn get_snapshot(&self) -> ContextSnapshot;
}

/// Receives the snapshot captured after an invocation.
#[cfg_attr(test, mockall::automock)]
pub trait SnapshotConsumer: Send + Sync {
    /// Accepts a freshly captured snapshot.
    fn accept(&self, snapshot: ContextSnapshot);
}

/// Holds the latest snapshot of a pipeline.
///
/// Reads and writes go through a lock, so a snapshot accepted on one worker
/// thread is visible to every later read on any other thread.
pub struct SnapshotHolder {
    snapshot: RwLock<ContextSnapshot>,
}

impl SnapshotHolder {
    /// Creates a holder seeded with `snapshot`.
    #[must_use]
    pub fn new(snapshot: ContextSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(snapshot),
        }
    }

    /// Creates a holder seeded with `snapshot`, or a fresh capture if `None`.
    #[must_use]
    pub fn new_or_capture(snapshot: Option<ContextSnapshot>) -> Self {
        Self::new(snapshot.unwrap_or_else(ContextSnapshot::capture))
    }
}

impl SnapshotSupplier for SnapshotHolder {
    fn get_snapshot(&self) -> ContextSnapshot {
        self.snapshot.read().clone()
    }
}

impl SnapshotConsumer for SnapshotHolder {
    fn accept(&self, snapshot: ContextSnapshot) {
        trace!(snapshot_id = %snapshot.id(), "Holder accepted new snapshot");
        *self.snapshot.write() = snapshot;
    }
}

impl fmt::Debug for SnapshotHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotHolder")
            .field("snapshot", &*self.snapshot.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_accept_replaces_snapshot() {
        let first = ContextSnapshot::empty();
        let second = ContextSnapshot::empty();
        let holder = SnapshotHolder::new(first.clone());
        assert_eq!(holder.get_snapshot().id(), first.id());

        holder.accept(second.clone());
        assert_eq!(holder.get_snapshot().id(), second.id());
    }

    #[test]
    fn test_accept_is_visible_across_threads() {
        let holder = Arc::new(SnapshotHolder::new(ContextSnapshot::empty()));
        let replacement = ContextSnapshot::empty();
        let expected = replacement.id();

        let writer = holder.clone();
        std::thread::spawn(move || writer.accept(replacement))
            .join()
            .unwrap();

        assert_eq!(holder.get_snapshot().id(), expected);
    }
}
