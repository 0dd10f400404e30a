//! The reactivate, run, capture, close sequence shared by every wrapper.

use crate::context::{ContextSnapshot, SnapshotConsumer, SnapshotSupplier};
use crate::errors::ContextflowError;
use std::fmt;
use std::sync::Arc;
use tracing::{error, warn};

/// Where a scope gets the snapshot to reactivate.
#[derive(Clone)]
pub enum SnapshotSource {
    /// Always the same snapshot.
    Fixed(ContextSnapshot),
    /// Asked for a snapshot on every invocation.
    Supplier(Arc<dyn SnapshotSupplier>),
}

impl SnapshotSource {
    /// Returns the snapshot to reactivate now.
    #[must_use]
    pub fn snapshot(&self) -> ContextSnapshot {
        match self {
            Self::Fixed(snapshot) => snapshot.clone(),
            Self::Supplier(supplier) => supplier.get_snapshot(),
        }
    }
}

impl From<ContextSnapshot> for SnapshotSource {
    fn from(snapshot: ContextSnapshot) -> Self {
        Self::Fixed(snapshot)
    }
}

impl From<Arc<dyn SnapshotSupplier>> for SnapshotSource {
    fn from(supplier: Arc<dyn SnapshotSupplier>) -> Self {
        Self::Supplier(supplier)
    }
}

impl fmt::Debug for SnapshotSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(snapshot) => f.debug_tuple("Fixed").field(snapshot).finish(),
            Self::Supplier(_) => f.write_str("Supplier"),
        }
    }
}

/// Runs closures inside a reactivated snapshot.
///
/// The snapshot is obtained from the source at invocation time. When a sink
/// is present, the managers that snapshot was captured from are captured
/// again at the end of the closure and the result is passed to the sink, also
/// when the closure panics.
#[derive(Clone)]
pub struct ContextScope {
    source: SnapshotSource,
    sink: Option<Arc<dyn SnapshotConsumer>>,
}

impl ContextScope {
    /// Creates a scope that always reactivates `snapshot`.
    #[must_use]
    pub fn new(snapshot: ContextSnapshot) -> Self {
        Self::from_source(SnapshotSource::Fixed(snapshot))
    }

    /// Creates a scope that asks `supplier` for the snapshot on each invocation.
    #[must_use]
    pub fn from_supplier(supplier: Arc<dyn SnapshotSupplier>) -> Self {
        Self::from_source(SnapshotSource::Supplier(supplier))
    }

    /// Creates a scope from a snapshot source.
    #[must_use]
    pub fn from_source(source: SnapshotSource) -> Self {
        Self { source, sink: None }
    }

    /// Sets the sink receiving the snapshot captured after each invocation.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn SnapshotConsumer>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Returns the snapshot source.
    #[must_use]
    pub fn source(&self) -> &SnapshotSource {
        &self.source
    }

    /// Returns true if a sink is configured.
    #[must_use]
    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    /// Runs `f` and returns its result together with the close outcome.
    ///
    /// If `f` panics the panic propagates after the previous context has been
    /// restored.
    pub fn run_and_close<R>(&self, f: impl FnOnce() -> R) -> (R, Result<(), ContextflowError>) {
        let snapshot = self.source.snapshot();
        let reactivation = snapshot.reactivate();
        let result = {
            let _capture = SinkCapture {
                snapshot: &snapshot,
                sink: self.sink.as_deref(),
            };
            f()
        };
        (result, reactivation.close())
    }

    /// Runs `f` inside the snapshot.
    ///
    /// A failure to restore the previous context is only logged; the result
    /// of `f` is returned regardless. Use [`ContextScope::try_enter`] when the
    /// failure must reach the caller.
    pub fn enter<R>(&self, f: impl FnOnce() -> R) -> R {
        let (result, closed) = self.run_and_close(f);
        if let Err(err) = closed {
            error!(error = %err, "Failed to restore context after invocation");
        }
        result
    }

    /// Runs a fallible `f` inside the snapshot.
    ///
    /// If `f` succeeds but the previous context cannot be restored, the
    /// restore failure is returned. If both fail, the error from `f` is
    /// returned and the restore failure is logged.
    pub fn try_enter<R, E>(&self, f: impl FnOnce() -> Result<R, E>) -> Result<R, E>
    where
        E: From<ContextflowError>,
    {
        match self.run_and_close(f) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(close_err)) => Err(E::from(close_err)),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(close_err)) => {
                warn!(error = %close_err, "Suppressed context restore failure after failed invocation");
                Err(err)
            }
        }
    }
}

impl fmt::Debug for ContextScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextScope")
            .field("source", &self.source)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

/// Recaptures the reactivated snapshot's managers into the sink when dropped,
/// so panics are covered too.
struct SinkCapture<'a> {
    snapshot: &'a ContextSnapshot,
    sink: Option<&'a dyn SnapshotConsumer>,
}

impl Drop for SinkCapture<'_> {
    fn drop(&mut self) {
        if let Some(sink) = self.sink {
            sink.accept(self.snapshot.recapture());
        }
    }
}
