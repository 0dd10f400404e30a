//! Context capture and reactivation.
//!
//! This module provides:
//! - The context manager SPI and the ordered manager registry
//! - Typed thread-local context slots
//! - Immutable snapshots of all active contexts, and reactivation handles
//! - The snapshot holder used to carry snapshots between chained stages

#[cfg(test)]
mod context_tests;
mod holder;
mod manager;
mod reactivation;
mod slot;
mod snapshot;

pub use holder::{SnapshotConsumer, SnapshotHolder, SnapshotSupplier};
#[cfg(test)]
pub use holder::MockSnapshotConsumer;
pub use manager::{ActiveContext, ContextManager, ContextManagers, ContextValue};
pub use reactivation::Reactivation;
pub use slot::{ContextSlot, SlotGuard};
pub use snapshot::ContextSnapshot;
