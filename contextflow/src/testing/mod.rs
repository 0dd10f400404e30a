//! Test doubles for code that propagates context.
//!
//! This module provides:
//! - A context manager that counts captures, activations and closes per thread
//! - A context manager that fails on demand
//! - A context timer that records every signal it receives

mod managers;
mod timers;

pub use managers::{ContextCounts, CountingContextManager, FailingContextManager};
pub use timers::{CollectingContextTimer, TimerEvent};
