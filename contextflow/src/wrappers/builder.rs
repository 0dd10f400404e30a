//! Builder for context wrappers.

use super::{ContextScope, ContextWrapper, SnapshotSource};
use crate::context::{ContextSnapshot, SnapshotConsumer, SnapshotSupplier};
use crate::errors::ContextflowError;
use std::sync::Arc;

/// Builds a [`ContextWrapper`], validating that nothing required is missing.
pub struct ContextWrapperBuilder<F> {
    delegate: Option<F>,
    source: Option<SnapshotSource>,
    sink: Option<Arc<dyn SnapshotConsumer>>,
}

impl<F> Default for ContextWrapperBuilder<F> {
    fn default() -> Self {
        Self {
            delegate: None,
            source: None,
            sink: None,
        }
    }
}

impl<F> ContextWrapperBuilder<F> {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the closure to wrap.
    #[must_use]
    pub fn delegate(mut self, delegate: F) -> Self {
        self.delegate = Some(delegate);
        self
    }

    /// Reactivates `snapshot` on every invocation.
    #[must_use]
    pub fn snapshot(mut self, snapshot: ContextSnapshot) -> Self {
        self.source = Some(SnapshotSource::Fixed(snapshot));
        self
    }

    /// Asks `supplier` for the snapshot on every invocation.
    #[must_use]
    pub fn snapshot_supplier(mut self, supplier: Arc<dyn SnapshotSupplier>) -> Self {
        self.source = Some(SnapshotSource::Supplier(supplier));
        self
    }

    /// Hands the context captured after each invocation to `sink`.
    #[must_use]
    pub fn result_sink(mut self, sink: Arc<dyn SnapshotConsumer>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Builds the wrapper.
    ///
    /// # Errors
    ///
    /// Returns [`ContextflowError::NullArgument`] without a delegate and
    /// [`ContextflowError::MissingSnapshot`] without a snapshot or supplier.
    pub fn build(self) -> Result<ContextWrapper<F>, ContextflowError> {
        let delegate = self
            .delegate
            .ok_or_else(|| ContextflowError::null_argument("delegate"))?;
        let source = self
            .source
            .ok_or_else(|| ContextflowError::missing_snapshot("ContextWrapper"))?;

        let mut scope = ContextScope::from_source(source);
        if let Some(sink) = self.sink {
            scope = scope.with_sink(sink);
        }
        Ok(ContextWrapper::from_scope(scope, delegate))
    }
}

impl<F> std::fmt::Debug for ContextWrapperBuilder<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextWrapperBuilder")
            .field("delegate", &self.delegate.is_some())
            .field("source", &self.source)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}
