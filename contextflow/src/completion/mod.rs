//! Deferred computations and context-aware pipelines built from them.

mod completable;
mod context_aware;
#[cfg(test)]
mod integration_tests;

pub use completable::{Completable, Outcome};
pub(crate) use completable::dispatch;
pub use context_aware::ContextAwareCompletable;
