//! Context-carrying wrappers for closures.
//!
//! A [`ContextWrapper`] owns a closure and a [`ContextScope`]. Every invocation
//! reactivates a snapshot, runs the closure, optionally hands a fresh capture
//! to a sink, and restores whatever was active before.

mod builder;
mod scope;
mod wrapper;

pub use builder::ContextWrapperBuilder;
pub use scope::{ContextScope, SnapshotSource};
pub use wrapper::ContextWrapper;
