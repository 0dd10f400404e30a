//! A closure bound to a context scope.

use super::{ContextScope, ContextWrapperBuilder};
use crate::context::{ContextSnapshot, SnapshotConsumer, SnapshotSupplier};
use crate::errors::ContextflowError;
use std::fmt;
use std::sync::Arc;

/// A closure that always runs inside a reactivated snapshot.
///
/// One wrapper type covers every arity: the invocation methods are available
/// whenever the delegate has the matching signature. Composed wrappers share
/// the original scope, so the whole composite runs inside a single
/// reactivation with at most one capture.
///
/// # Example
///
/// ```rust
/// use contextflow::prelude::*;
///
/// let locale = ContextSlot::<String>::register("locale");
/// let snapshot = {
///     let _guard = locale.set("nl-NL".to_string());
///     ContextSnapshot::capture()
/// };
///
/// let greet = ContextWrapper::new(snapshot, {
///     let locale = locale.clone();
///     move |name: &str| format!("{name} ({})", locale.get_cloned().unwrap_or_default())
/// });
///
/// assert_eq!(greet.apply("Ada"), "Ada (nl-NL)");
/// assert!(locale.get().is_none());
/// ```
#[derive(Clone)]
pub struct ContextWrapper<F> {
    scope: ContextScope,
    delegate: F,
}

impl<F> ContextWrapper<F> {
    /// Wraps `delegate` to run inside `snapshot`.
    #[must_use]
    pub fn new(snapshot: ContextSnapshot, delegate: F) -> Self {
        Self::from_scope(ContextScope::new(snapshot), delegate)
    }

    /// Wraps `delegate` to run inside whatever `supplier` returns at invocation time.
    #[must_use]
    pub fn with_supplier(supplier: Arc<dyn SnapshotSupplier>, delegate: F) -> Self {
        Self::from_scope(ContextScope::from_supplier(supplier), delegate)
    }

    /// Wraps `delegate` with an existing scope.
    #[must_use]
    pub fn from_scope(scope: ContextScope, delegate: F) -> Self {
        Self { scope, delegate }
    }

    /// Starts a builder.
    #[must_use]
    pub fn builder() -> ContextWrapperBuilder<F> {
        ContextWrapperBuilder::new()
    }

    /// Sets the sink receiving the snapshot captured after each invocation.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn SnapshotConsumer>) -> Self {
        self.scope = self.scope.with_sink(sink);
        self
    }

    /// Returns the scope.
    #[must_use]
    pub fn scope(&self) -> &ContextScope {
        &self.scope
    }

    /// Returns the delegate without its scope.
    pub fn into_inner(self) -> F {
        self.delegate
    }

    fn map_delegate<G>(self, f: impl FnOnce(F) -> G) -> ContextWrapper<G> {
        ContextWrapper {
            scope: self.scope,
            delegate: f(self.delegate),
        }
    }

    /// Runs a supplier or runnable.
    ///
    /// A failure to restore the previous context is only logged; use
    /// [`ContextWrapper::try_run`] when it must reach the caller.
    pub fn run<R>(&self) -> R
    where
        F: Fn() -> R,
    {
        self.scope.enter(&self.delegate)
    }

    /// Runs a one-shot supplier or runnable.
    ///
    /// A failure to restore the previous context is only logged; use
    /// [`ContextWrapper::try_run`] when it must reach the caller.
    pub fn run_once<R>(self) -> R
    where
        F: FnOnce() -> R,
    {
        let Self { scope, delegate } = self;
        scope.enter(delegate)
    }

    /// Applies a function, operator or consumer.
    ///
    /// A failure to restore the previous context is only logged; use
    /// [`ContextWrapper::try_apply`] when it must reach the caller.
    pub fn apply<T, R>(&self, arg: T) -> R
    where
        F: Fn(T) -> R,
    {
        self.scope.enter(|| (self.delegate)(arg))
    }

    /// Applies a one-shot function.
    ///
    /// Restore failures are only logged.
    pub fn apply_once<T, R>(self, arg: T) -> R
    where
        F: FnOnce(T) -> R,
    {
        let Self { scope, delegate } = self;
        scope.enter(|| delegate(arg))
    }

    /// Tests a predicate.
    ///
    /// A failure to restore the previous context is only logged; use
    /// [`ContextWrapper::try_apply`] when it must reach the caller.
    pub fn test<T: ?Sized>(&self, arg: &T) -> bool
    where
        F: Fn(&T) -> bool,
    {
        self.scope.enter(|| (self.delegate)(arg))
    }

    /// Applies a two-argument function, operator or consumer.
    ///
    /// Restore failures are only logged.
    pub fn apply2<T, U, R>(&self, first: T, second: U) -> R
    where
        F: Fn(T, U) -> R,
    {
        self.scope.enter(|| (self.delegate)(first, second))
    }

    /// Applies a one-shot two-argument function.
    ///
    /// Restore failures are only logged.
    pub fn apply2_once<T, U, R>(self, first: T, second: U) -> R
    where
        F: FnOnce(T, U) -> R,
    {
        let Self { scope, delegate } = self;
        scope.enter(|| delegate(first, second))
    }

    /// Tests a two-argument predicate.
    ///
    /// Restore failures are only logged.
    pub fn test2<T: ?Sized, U: ?Sized>(&self, first: &T, second: &U) -> bool
    where
        F: Fn(&T, &U) -> bool,
    {
        self.scope.enter(|| (self.delegate)(first, second))
    }

    /// Runs a fallible supplier.
    ///
    /// A restore failure becomes the error only if the supplier succeeded.
    pub fn try_run<R, E>(&self) -> Result<R, E>
    where
        F: Fn() -> Result<R, E>,
        E: From<ContextflowError>,
    {
        self.scope.try_enter(&self.delegate)
    }

    /// Applies a fallible function.
    ///
    /// A restore failure becomes the error only if the function succeeded.
    pub fn try_apply<T, R, E>(&self, arg: T) -> Result<R, E>
    where
        F: Fn(T) -> Result<R, E>,
        E: From<ContextflowError>,
    {
        self.scope.try_enter(|| (self.delegate)(arg))
    }

    /// Feeds the result of this function into `after`.
    pub fn and_then<T, R, V, G>(self, after: G) -> ContextWrapper<impl Fn(T) -> V>
    where
        F: Fn(T) -> R,
        G: Fn(R) -> V,
    {
        self.map_delegate(|delegate| move |arg: T| after(delegate(arg)))
    }

    /// Feeds the result of `before` into this function.
    pub fn compose<V, T, R, G>(self, before: G) -> ContextWrapper<impl Fn(V) -> R>
    where
        F: Fn(T) -> R,
        G: Fn(V) -> T,
    {
        self.map_delegate(|delegate| move |arg: V| delegate(before(arg)))
    }

    /// Feeds the result of this two-argument function into `after`.
    pub fn and_then2<T, U, R, V, G>(self, after: G) -> ContextWrapper<impl Fn(T, U) -> V>
    where
        F: Fn(T, U) -> R,
        G: Fn(R) -> V,
    {
        self.map_delegate(|delegate| move |first: T, second: U| after(delegate(first, second)))
    }

    /// Passes the same argument to this consumer, then to `after`.
    pub fn also<T: ?Sized, G>(self, after: G) -> ContextWrapper<impl Fn(&T)>
    where
        F: Fn(&T),
        G: Fn(&T),
    {
        self.map_delegate(|delegate| {
            move |arg: &T| {
                delegate(arg);
                after(arg);
            }
        })
    }

    /// Passes the same arguments to this two-argument consumer, then to `after`.
    pub fn also2<T: ?Sized, U: ?Sized, G>(self, after: G) -> ContextWrapper<impl Fn(&T, &U)>
    where
        F: Fn(&T, &U),
        G: Fn(&T, &U),
    {
        self.map_delegate(|delegate| {
            move |first: &T, second: &U| {
                delegate(first, second);
                after(first, second);
            }
        })
    }

    /// Short-circuiting logical AND of two predicates.
    pub fn and<T: ?Sized, G>(self, other: G) -> ContextWrapper<impl Fn(&T) -> bool>
    where
        F: Fn(&T) -> bool,
        G: Fn(&T) -> bool,
    {
        self.map_delegate(|delegate| move |arg: &T| delegate(arg) && other(arg))
    }

    /// Short-circuiting logical OR of two predicates.
    pub fn or<T: ?Sized, G>(self, other: G) -> ContextWrapper<impl Fn(&T) -> bool>
    where
        F: Fn(&T) -> bool,
        G: Fn(&T) -> bool,
    {
        self.map_delegate(|delegate| move |arg: &T| delegate(arg) || other(arg))
    }

    /// Logical negation of a predicate.
    pub fn negate<T: ?Sized>(self) -> ContextWrapper<impl Fn(&T) -> bool>
    where
        F: Fn(&T) -> bool,
    {
        self.map_delegate(|delegate| move |arg: &T| !delegate(arg))
    }

    /// Short-circuiting logical AND of two bi-predicates.
    pub fn and2<T: ?Sized, U: ?Sized, G>(self, other: G) -> ContextWrapper<impl Fn(&T, &U) -> bool>
    where
        F: Fn(&T, &U) -> bool,
        G: Fn(&T, &U) -> bool,
    {
        self.map_delegate(|delegate| {
            move |first: &T, second: &U| delegate(first, second) && other(first, second)
        })
    }

    /// Short-circuiting logical OR of two bi-predicates.
    pub fn or2<T: ?Sized, U: ?Sized, G>(self, other: G) -> ContextWrapper<impl Fn(&T, &U) -> bool>
    where
        F: Fn(&T, &U) -> bool,
        G: Fn(&T, &U) -> bool,
    {
        self.map_delegate(|delegate| {
            move |first: &T, second: &U| delegate(first, second) || other(first, second)
        })
    }

    /// Logical negation of a bi-predicate.
    pub fn negate2<T: ?Sized, U: ?Sized>(self) -> ContextWrapper<impl Fn(&T, &U) -> bool>
    where
        F: Fn(&T, &U) -> bool,
    {
        self.map_delegate(|delegate| move |first: &T, second: &U| !delegate(first, second))
    }
}

impl<F> fmt::Debug for ContextWrapper<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextWrapper")
            .field("scope", &self.scope)
            .field("delegate", &std::any::type_name::<F>())
            .finish()
    }
}
