//! Observability hooks for context propagation.
//!
//! Timing and error signals are keyed by [`ContextOperation`] and delivered to
//! a process-wide [`ContextTimer`]. Nothing in the propagation logic depends on
//! what the timer does with them.

mod timer;

pub use timer::{
    clear_context_timer, context_timer, set_context_timer, ContextOperation, ContextTimer,
    LoggingContextTimer, NoOpContextTimer, OperationTimer,
};
