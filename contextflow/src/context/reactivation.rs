//! Undo record for one snapshot reactivation.

use super::ActiveContext;
use crate::errors::{ContextflowError, RestoreError};
use crate::observability::{ContextOperation, OperationTimer};
use std::fmt;
use tracing::{error, trace};
use uuid::Uuid;

/// Restores the contexts that were active before [`ContextSnapshot::reactivate`].
///
/// Close it with [`Reactivation::close`] to observe restore failures. Dropping
/// it without closing (for example while unwinding) still restores, and logs
/// any failure. It cannot leave the thread that reactivated.
///
/// [`ContextSnapshot::reactivate`]: super::ContextSnapshot::reactivate
#[must_use = "contexts are restored as soon as the reactivation is dropped"]
pub struct Reactivation {
    snapshot_id: Uuid,
    active: Vec<(String, Box<dyn ActiveContext>)>,
}

impl Reactivation {
    pub(crate) fn new(snapshot_id: Uuid, active: Vec<(String, Box<dyn ActiveContext>)>) -> Self {
        Self {
            snapshot_id,
            active,
        }
    }

    /// Returns the id of the reactivated snapshot.
    #[must_use]
    pub fn snapshot_id(&self) -> Uuid {
        self.snapshot_id
    }

    /// Returns the number of slots that were activated.
    #[must_use]
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Returns true if no slot was activated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Restores every slot in reverse activation order.
    ///
    /// All slots are attempted even if some fail; the failures are returned
    /// together as [`ContextflowError::Restore`].
    pub fn close(mut self) -> Result<(), ContextflowError> {
        self.restore()
    }

    fn restore(&mut self) -> Result<(), ContextflowError> {
        let timer = OperationTimer::start(ContextOperation::Close);
        let mut failures = RestoreError::new();

        while let Some((slot, handle)) = self.active.pop() {
            if let Err(err) = handle.close() {
                failures.push(slot, err);
            }
        }

        let result = failures.into_result();
        match result {
            Ok(()) => trace!(snapshot_id = %self.snapshot_id, "Closed reactivation"),
            Err(ref err) => timer.fail(err),
        }
        let _ = timer.finish();
        result
    }
}

impl Drop for Reactivation {
    fn drop(&mut self) {
        if self.active.is_empty() {
            return;
        }
        if let Err(err) = self.restore() {
            error!(
                snapshot_id = %self.snapshot_id,
                error = %err,
                "Failed to restore context while dropping reactivation"
            );
        }
    }
}

impl fmt::Debug for Reactivation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots: Vec<&str> = self.active.iter().map(|(slot, _)| slot.as_str()).collect();
        f.debug_struct("Reactivation")
            .field("snapshot_id", &self.snapshot_id)
            .field("slots", &slots)
            .finish()
    }
}
