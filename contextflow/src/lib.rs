//! # Contextflow
//!
//! Carries thread-local context across thread boundaries.
//!
//! Context that lives in thread-local slots (request ids, tenants, trace
//! spans) is lost when work hops to another thread. Contextflow provides:
//!
//! - **Snapshots**: immutable captures of every registered context slot
//! - **Reactivation**: installing a snapshot on any thread and restoring what
//!   was active before
//! - **Wrappers**: closures that run inside a snapshot, with composition
//! - **Context-aware pipelines**: chained completion stages that carry context
//!   forward, optionally adopting the context each stage leaves behind
//! - **Context-aware executors**: task submission in the submitter's context
//!
//! ## Quick Start
//!
//! ```rust
//! use contextflow::prelude::*;
//!
//! let user = ContextSlot::<String>::register("user");
//! let _guard = user.set("Parent".to_string());
//!
//! // Runs on another thread but sees "Parent".
//! let stage = {
//!     let user = user.clone();
//!     ContextAwareCompletable::supply_async(
//!         move || user.get_cloned(),
//!         &ThreadExecutor::new(),
//!         None,
//!         false,
//!     )
//! };
//! assert_eq!(stage.join().unwrap().as_deref(), Some("Parent"));
//!
//! // A wrapper reactivates its snapshot on every call.
//! let snapshot = ContextSnapshot::capture();
//! let greet = ContextWrapper::new(snapshot, {
//!     let user = user.clone();
//!     move |greeting: &str| format!("{greeting}, {}", user.get_cloned().unwrap_or_default())
//! });
//! assert_eq!(greet.apply("hello"), "hello, Parent");
//!
//! let done = Completable::completed(1).then_apply(|x| x + 1);
//! assert_eq!(done.join().unwrap(), 2);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod completion;
pub mod config;
pub mod context;
pub mod errors;
pub mod executor;
pub mod observability;
pub mod testing;
pub mod wrappers;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::completion::{Completable, ContextAwareCompletable, Outcome};
    pub use crate::config::{config, PropagationConfig};
    pub use crate::context::{
        ContextManager, ContextManagers, ContextSlot, ContextSnapshot, Reactivation,
        SnapshotConsumer, SnapshotHolder, SnapshotSupplier,
    };
    pub use crate::errors::{CompletionError, ContextflowError, RestoreError, TaskError};
    pub use crate::executor::{
        ContextAwareExecutor, Executor, InlineExecutor, ThreadExecutor, TokioExecutor,
    };
    pub use crate::observability::{ContextOperation, ContextTimer};
    pub use crate::wrappers::{ContextScope, ContextWrapper};
}
