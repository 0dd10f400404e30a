//! Deferred computations whose continuations run inside a carried context.

use super::completable::{dispatch, flatten, observe, Completable, Outcome};
use crate::context::{ContextSnapshot, SnapshotHolder, SnapshotSupplier};
use crate::errors::CompletionError;
use crate::executor::Executor;
use crate::wrappers::ContextScope;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

/// A [`Completable`] whose continuations run inside the pipeline's snapshot.
///
/// Every stage derived from a root shares the root's [`SnapshotHolder`]. With
/// `take_new_snapshot` enabled, each continuation captures the context it
/// leaves behind into the holder, so the next stage sees it. Racing
/// combinators and aggregates get a holder of their own.
///
/// If the context active before a continuation cannot be restored after it
/// ran, the dependent stage fails with the restore failure, unless the
/// continuation itself failed.
///
/// # Example
///
/// ```rust
/// use contextflow::prelude::*;
///
/// let request = ContextSlot::<String>::register("request-id");
/// let _guard = request.set("req-1".to_string());
///
/// let slot = request.clone();
/// let seen = ContextAwareCompletable::supply_async(
///     move || slot.get_cloned(),
///     &ThreadExecutor::new(),
///     None,
///     false,
/// );
/// assert_eq!(seen.join().unwrap().as_deref(), Some("req-1"));
/// ```
pub struct ContextAwareCompletable<T> {
    inner: Completable<T>,
    holder: Arc<SnapshotHolder>,
    take_new_snapshot: bool,
}

impl<T> Clone for ContextAwareCompletable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            holder: self.holder.clone(),
            take_new_snapshot: self.take_new_snapshot,
        }
    }
}

impl<T> AsRef<Completable<T>> for ContextAwareCompletable<T> {
    fn as_ref(&self) -> &Completable<T> {
        &self.inner
    }
}

impl<T> From<ContextAwareCompletable<T>> for Completable<T> {
    fn from(stage: ContextAwareCompletable<T>) -> Self {
        stage.inner
    }
}

/// Runs `f` in `scope`; a restore failure becomes the outcome.
fn settle<R>(scope: &ContextScope, f: impl FnOnce() -> R) -> Outcome<R> {
    scope.try_enter(|| Ok(f()))
}

/// Runs a fallible `f` in `scope`; its own failure wins over a restore failure.
fn try_settle<R>(scope: &ContextScope, f: impl FnOnce() -> anyhow::Result<R>) -> Outcome<R> {
    scope.try_enter(|| f().map_err(CompletionError::from_anyhow))
}

fn scope_for(holder: &Arc<SnapshotHolder>, take_new_snapshot: bool) -> ContextScope {
    let scope = ContextScope::from_supplier(holder.clone());
    if take_new_snapshot {
        scope.with_sink(holder.clone())
    } else {
        scope
    }
}

impl<T: Clone + Send + Sync + 'static> Default for ContextAwareCompletable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> ContextAwareCompletable<T> {
    /// Creates an incomplete root stage carrying the current context.
    #[must_use]
    pub fn new() -> Self {
        Self::with_snapshot(None)
    }

    /// Creates an incomplete root stage carrying `snapshot`, or the current
    /// context if `None`.
    #[must_use]
    pub fn with_snapshot(snapshot: Option<ContextSnapshot>) -> Self {
        Self::from_completable(Completable::new(), snapshot)
    }

    /// Creates a root stage already completed with `value`.
    #[must_use]
    pub fn completed(value: T, snapshot: Option<ContextSnapshot>) -> Self {
        Self::from_completable(Completable::completed(value), snapshot)
    }

    /// Makes an existing computation context-aware.
    #[must_use]
    pub fn from_completable(inner: Completable<T>, snapshot: Option<ContextSnapshot>) -> Self {
        Self {
            inner,
            holder: Arc::new(SnapshotHolder::new_or_capture(snapshot)),
            take_new_snapshot: false,
        }
    }

    /// Runs `f` on `executor` inside `snapshot`, or the current context if `None`.
    ///
    /// With `take_new_snapshot`, the context `f` leaves behind is carried to
    /// the next stage.
    pub fn supply_async<F>(
        f: F,
        executor: &dyn Executor,
        snapshot: Option<ContextSnapshot>,
        take_new_snapshot: bool,
    ) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let holder = Arc::new(SnapshotHolder::new_or_capture(snapshot));
        let scope = scope_for(&holder, take_new_snapshot);
        let inner = Completable::new();
        dispatch(executor, inner.clone(), move || settle(&scope, f));
        Self {
            inner,
            holder,
            take_new_snapshot,
        }
    }

    fn derive<U>(&self, inner: Completable<U>) -> ContextAwareCompletable<U> {
        ContextAwareCompletable {
            inner,
            holder: self.holder.clone(),
            take_new_snapshot: self.take_new_snapshot,
        }
    }

    fn scope(&self) -> ContextScope {
        scope_for(&self.holder, self.take_new_snapshot)
    }

    /// Completes a derived stage with `f` applied to `source`'s outcome,
    /// inside this stage's scope.
    fn follow<S, U, F>(
        &self,
        source: &Completable<S>,
        executor: Option<&Arc<dyn Executor>>,
        f: F,
    ) -> ContextAwareCompletable<U>
    where
        S: Clone + Send + Sync + 'static,
        U: Clone + Send + Sync + 'static,
        F: FnOnce(&ContextScope, Outcome<S>) -> Outcome<U> + Send + 'static,
    {
        let scope = self.scope();
        self.derive(source.chain(executor, move |outcome| f(&scope, outcome)))
    }

    /// Races this stage against `other` in a holder of its own, seeded from
    /// this stage's holder when the race is set up.
    fn race<U, F>(
        &self,
        other: &Completable<T>,
        executor: Option<&Arc<dyn Executor>>,
        f: F,
    ) -> ContextAwareCompletable<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(&ContextScope, Outcome<T>) -> Outcome<U> + Send + 'static,
    {
        let holder = Arc::new(SnapshotHolder::new(self.holder.get_snapshot()));
        let scope = scope_for(&holder, self.take_new_snapshot);
        let inner = self
            .inner
            .either(other)
            .chain(executor, move |outcome| f(&scope, outcome));
        ContextAwareCompletable {
            inner,
            holder,
            take_new_snapshot: self.take_new_snapshot,
        }
    }

    /// Returns this stage with propagate-forward mode set to `enabled`.
    ///
    /// Returns `self` unchanged if the mode is already `enabled`; otherwise a
    /// stage over the same computation and holder.
    #[must_use]
    pub fn take_new_snapshot(self, enabled: bool) -> Self {
        if self.take_new_snapshot == enabled {
            return self;
        }
        Self {
            take_new_snapshot: enabled,
            ..self
        }
    }

    /// Returns true if continuations carry their context forward.
    #[must_use]
    pub fn take_new_snapshot_enabled(&self) -> bool {
        self.take_new_snapshot
    }

    /// Returns the snapshot the next continuation will reactivate.
    #[must_use]
    pub fn snapshot(&self) -> ContextSnapshot {
        self.holder.get_snapshot()
    }

    /// Returns the underlying computation.
    #[must_use]
    pub fn completable(&self) -> &Completable<T> {
        &self.inner
    }

    /// Returns true if `other` shares this stage's snapshot holder.
    #[must_use]
    pub fn shares_holder_with<U>(&self, other: &ContextAwareCompletable<U>) -> bool {
        Arc::ptr_eq(&self.holder, &other.holder)
    }

    /// Completes with `value` unless already complete.
    pub fn complete(&self, value: T) -> bool {
        self.inner.complete(value)
    }

    /// Completes with `error` unless already complete.
    pub fn complete_exceptionally(&self, error: CompletionError) -> bool {
        self.inner.complete_exceptionally(error)
    }

    /// Cancels unless already complete.
    pub fn cancel(&self) -> bool {
        self.inner.cancel()
    }

    /// Returns true once completed in any way.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.inner.is_done()
    }

    /// Returns true if completed with a failure.
    #[must_use]
    pub fn is_completed_exceptionally(&self) -> bool {
        self.inner.is_completed_exceptionally()
    }

    /// Returns true if cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Blocks until complete.
    pub fn join(&self) -> Outcome<T> {
        self.inner.join()
    }

    /// Blocks until complete or until `timeout` elapses.
    pub fn join_timeout(&self, timeout: Duration) -> Outcome<T> {
        self.inner.join_timeout(timeout)
    }

    /// Returns the outcome if complete, otherwise `Ok(if_absent)`.
    pub fn now(&self, if_absent: T) -> Outcome<T> {
        self.inner.now(if_absent)
    }

    /// Transforms the value inside the carried context.
    ///
    /// If the previous context cannot be restored afterwards, the stage fails
    /// with the restore failure.
    pub fn then_apply<U, F>(&self, f: F) -> ContextAwareCompletable<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.follow(&self.inner, None, move |scope, outcome| {
            outcome.and_then(|value| settle(scope, || f(value)))
        })
    }

    /// Transforms the value on `executor` inside the carried context.
    pub fn then_apply_async<U, F>(
        &self,
        f: F,
        executor: &Arc<dyn Executor>,
    ) -> ContextAwareCompletable<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.follow(&self.inner, Some(executor), move |scope, outcome| {
            outcome.and_then(|value| settle(scope, || f(value)))
        })
    }

    /// Transforms the value with a fallible function inside the carried context.
    ///
    /// A restore failure fails the stage only if `f` succeeded.
    pub fn then_try_apply<U, F>(&self, f: F) -> ContextAwareCompletable<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> anyhow::Result<U> + Send + 'static,
    {
        self.follow(&self.inner, None, move |scope, outcome| {
            outcome.and_then(|value| try_settle(scope, || f(value)))
        })
    }

    /// Fallible transform on `executor` inside the carried context.
    pub fn then_try_apply_async<U, F>(
        &self,
        f: F,
        executor: &Arc<dyn Executor>,
    ) -> ContextAwareCompletable<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> anyhow::Result<U> + Send + 'static,
    {
        self.follow(&self.inner, Some(executor), move |scope, outcome| {
            outcome.and_then(|value| try_settle(scope, || f(value)))
        })
    }

    /// Consumes the value inside the carried context.
    pub fn then_accept<F>(&self, f: F) -> ContextAwareCompletable<()>
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.then_apply(f)
    }

    /// Consumes the value on `executor` inside the carried context.
    pub fn then_accept_async<F>(
        &self,
        f: F,
        executor: &Arc<dyn Executor>,
    ) -> ContextAwareCompletable<()>
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.then_apply_async(f, executor)
    }

    /// Runs `f` inside the carried context after a successful completion.
    pub fn then_run<F>(&self, f: F) -> ContextAwareCompletable<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.then_apply(move |_| f())
    }

    /// Runs `f` on `executor` inside the carried context.
    pub fn then_run_async<F>(&self, f: F, executor: &Arc<dyn Executor>) -> ContextAwareCompletable<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.then_apply_async(move |_| f(), executor)
    }

    /// Continues with the stage `f` returns, calling `f` inside the carried context.
    pub fn then_compose<U, S, F>(&self, f: F) -> ContextAwareCompletable<U>
    where
        U: Clone + Send + Sync + 'static,
        S: Into<Completable<U>>,
        F: FnOnce(T) -> S + Send + 'static,
    {
        self.compose_on(None, f)
    }

    /// Continues with the stage `f` returns, calling `f` on `executor`.
    pub fn then_compose_async<U, S, F>(
        &self,
        f: F,
        executor: &Arc<dyn Executor>,
    ) -> ContextAwareCompletable<U>
    where
        U: Clone + Send + Sync + 'static,
        S: Into<Completable<U>>,
        F: FnOnce(T) -> S + Send + 'static,
    {
        self.compose_on(Some(executor), f)
    }

    fn compose_on<U, S, F>(
        &self,
        executor: Option<&Arc<dyn Executor>>,
        f: F,
    ) -> ContextAwareCompletable<U>
    where
        U: Clone + Send + Sync + 'static,
        S: Into<Completable<U>>,
        F: FnOnce(T) -> S + Send + 'static,
    {
        let scope = self.scope();
        let nested = self.inner.chain(executor, move |outcome| {
            outcome.and_then(|value| settle(&scope, || Into::<Completable<U>>::into(f(value))))
        });
        self.derive(flatten(nested))
    }

    /// Maps the outcome inside the carried context.
    pub fn handle<U, F>(&self, f: F) -> ContextAwareCompletable<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(Outcome<T>) -> U + Send + 'static,
    {
        self.follow(&self.inner, None, move |scope, outcome| settle(scope, || f(outcome)))
    }

    /// Maps the outcome on `executor` inside the carried context.
    pub fn handle_async<U, F>(&self, f: F, executor: &Arc<dyn Executor>) -> ContextAwareCompletable<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(Outcome<T>) -> U + Send + 'static,
    {
        self.follow(&self.inner, Some(executor), move |scope, outcome| {
            settle(scope, || f(outcome))
        })
    }

    /// Observes the outcome inside the carried context.
    ///
    /// After a failed completion the original failure is kept, even if the
    /// previous context cannot be restored.
    pub fn when_complete<F>(&self, f: F) -> Self
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        self.follow(&self.inner, None, move |scope, outcome| {
            scope.try_enter(|| observe(outcome, f))
        })
    }

    /// Observes the outcome on `executor` inside the carried context.
    pub fn when_complete_async<F>(&self, f: F, executor: &Arc<dyn Executor>) -> Self
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        self.follow(&self.inner, Some(executor), move |scope, outcome| {
            scope.try_enter(|| observe(outcome, f))
        })
    }

    /// Recovers from a failure inside the carried context.
    pub fn exceptionally<F>(&self, f: F) -> Self
    where
        F: FnOnce(CompletionError) -> T + Send + 'static,
    {
        self.follow(&self.inner, None, move |scope, outcome| {
            outcome.or_else(|err| settle(scope, || f(err)))
        })
    }

    /// Recovers from a failure on `executor` inside the carried context.
    pub fn exceptionally_async<F>(&self, f: F, executor: &Arc<dyn Executor>) -> Self
    where
        F: FnOnce(CompletionError) -> T + Send + 'static,
    {
        self.follow(&self.inner, Some(executor), move |scope, outcome| {
            outcome.or_else(|err| settle(scope, || f(err)))
        })
    }

    /// Combines with `other` inside the carried context.
    pub fn then_combine<U, V, F>(
        &self,
        other: &impl AsRef<Completable<U>>,
        f: F,
    ) -> ContextAwareCompletable<V>
    where
        U: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        F: FnOnce(T, U) -> V + Send + 'static,
    {
        let pair = self.inner.both(other.as_ref());
        self.follow(&pair, None, move |scope, outcome| {
            outcome.and_then(|(a, b)| settle(scope, || f(a, b)))
        })
    }

    /// Combines with `other` on `executor` inside the carried context.
    pub fn then_combine_async<U, V, F>(
        &self,
        other: &impl AsRef<Completable<U>>,
        f: F,
        executor: &Arc<dyn Executor>,
    ) -> ContextAwareCompletable<V>
    where
        U: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        F: FnOnce(T, U) -> V + Send + 'static,
    {
        let pair = self.inner.both(other.as_ref());
        self.follow(&pair, Some(executor), move |scope, outcome| {
            outcome.and_then(|(a, b)| settle(scope, || f(a, b)))
        })
    }

    /// Consumes both values inside the carried context.
    pub fn then_accept_both<U, F>(
        &self,
        other: &impl AsRef<Completable<U>>,
        f: F,
    ) -> ContextAwareCompletable<()>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T, U) + Send + 'static,
    {
        self.then_combine(other, f)
    }

    /// Consumes both values on `executor` inside the carried context.
    pub fn then_accept_both_async<U, F>(
        &self,
        other: &impl AsRef<Completable<U>>,
        f: F,
        executor: &Arc<dyn Executor>,
    ) -> ContextAwareCompletable<()>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T, U) + Send + 'static,
    {
        self.then_combine_async(other, f, executor)
    }

    /// Runs `f` inside the carried context once both stages succeeded.
    pub fn run_after_both<U, F>(
        &self,
        other: &impl AsRef<Completable<U>>,
        f: F,
    ) -> ContextAwareCompletable<()>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce() + Send + 'static,
    {
        self.then_combine(other, move |_, _| f())
    }

    /// Runs `f` on `executor` inside the carried context once both stages succeeded.
    pub fn run_after_both_async<U, F>(
        &self,
        other: &impl AsRef<Completable<U>>,
        f: F,
        executor: &Arc<dyn Executor>,
    ) -> ContextAwareCompletable<()>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce() + Send + 'static,
    {
        self.then_combine_async(other, move |_, _| f(), executor)
    }

    /// Transforms the first of this stage and `other` to complete.
    ///
    /// The result gets a holder of its own, seeded from this stage's holder.
    pub fn apply_to_either<U, F>(
        &self,
        other: &impl AsRef<Completable<T>>,
        f: F,
    ) -> ContextAwareCompletable<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.race(other.as_ref(), None, move |scope, outcome| {
            outcome.and_then(|value| settle(scope, || f(value)))
        })
    }

    /// Transforms the first completion on `executor`, with a holder of its own.
    pub fn apply_to_either_async<U, F>(
        &self,
        other: &impl AsRef<Completable<T>>,
        f: F,
        executor: &Arc<dyn Executor>,
    ) -> ContextAwareCompletable<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.race(other.as_ref(), Some(executor), move |scope, outcome| {
            outcome.and_then(|value| settle(scope, || f(value)))
        })
    }

    /// Consumes the first value, with a holder of its own.
    pub fn accept_either<F>(
        &self,
        other: &impl AsRef<Completable<T>>,
        f: F,
    ) -> ContextAwareCompletable<()>
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.apply_to_either(other, f)
    }

    /// Consumes the first value on `executor`, with a holder of its own.
    pub fn accept_either_async<F>(
        &self,
        other: &impl AsRef<Completable<T>>,
        f: F,
        executor: &Arc<dyn Executor>,
    ) -> ContextAwareCompletable<()>
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.apply_to_either_async(other, f, executor)
    }

    /// Runs `f` after the first completion, with a holder of its own.
    pub fn run_after_either<F>(
        &self,
        other: &impl AsRef<Completable<T>>,
        f: F,
    ) -> ContextAwareCompletable<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.apply_to_either(other, move |_| f())
    }

    /// Runs `f` on `executor` after the first completion, with a holder of its own.
    pub fn run_after_either_async<F>(
        &self,
        other: &impl AsRef<Completable<T>>,
        f: F,
        executor: &Arc<dyn Executor>,
    ) -> ContextAwareCompletable<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.apply_to_either_async(other, move |_| f(), executor)
    }

    /// Completes once every stage has completed.
    ///
    /// The result carries `snapshot`, or the current context if `None`, in a
    /// holder of its own. It never adopts a branch's context implicitly; pass
    /// `Some(branch.snapshot())` to continue from a specific branch.
    pub fn all_of(
        snapshot: Option<ContextSnapshot>,
        stages: impl IntoIterator<Item = Self>,
    ) -> ContextAwareCompletable<Vec<T>> {
        let holder = Arc::new(SnapshotHolder::new_or_capture(snapshot));
        ContextAwareCompletable {
            inner: Completable::all_of(stages.into_iter().map(|stage| stage.inner)),
            holder,
            take_new_snapshot: false,
        }
    }

    /// Completes with whichever stage completes first.
    ///
    /// The result carries `snapshot`, or the current context if `None`, in a
    /// holder of its own.
    pub fn any_of(
        snapshot: Option<ContextSnapshot>,
        stages: impl IntoIterator<Item = Self>,
    ) -> Self {
        let holder = Arc::new(SnapshotHolder::new_or_capture(snapshot));
        Self {
            inner: Completable::any_of(stages.into_iter().map(|stage| stage.inner)),
            holder,
            take_new_snapshot: false,
        }
    }
}

impl ContextAwareCompletable<()> {
    /// Runs `f` on `executor` inside `snapshot`, or the current context if `None`.
    pub fn run_async<F>(
        f: F,
        executor: &dyn Executor,
        snapshot: Option<ContextSnapshot>,
        take_new_snapshot: bool,
    ) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::supply_async(f, executor, snapshot, take_new_snapshot)
    }
}

impl<T: Clone> Future for ContextAwareCompletable<T> {
    type Output = Outcome<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx)
    }
}

impl<T> fmt::Debug for ContextAwareCompletable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextAwareCompletable")
            .field("inner", &self.inner)
            .field("holder", &self.holder)
            .field("take_new_snapshot", &self.take_new_snapshot)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextManagers, ContextSlot};
    use crate::errors::ContextflowError;
    use crate::executor::InlineExecutor;
    use crate::testing::FailingContextManager;

    fn broken_restore() -> ContextSnapshot {
        let registry = ContextManagers::new();
        registry.register(Arc::new(FailingContextManager::new("broken").fail_on_close()));
        registry.capture()
    }

    fn is_restore_failure(err: &CompletionError) -> bool {
        matches!(
            err.downcast_ref::<ContextflowError>(),
            Some(ContextflowError::Restore(_))
        )
    }

    #[test]
    fn test_take_new_snapshot_toggle() {
        let root = ContextAwareCompletable::<u8>::with_snapshot(Some(ContextSnapshot::empty()));
        assert!(!root.take_new_snapshot_enabled());

        let same = root.clone().take_new_snapshot(false);
        assert!(same.shares_holder_with(&root));
        assert!(!same.take_new_snapshot_enabled());

        let forward = root.clone().take_new_snapshot(true);
        let forward_again = forward.clone().take_new_snapshot(true);
        assert!(forward.take_new_snapshot_enabled());
        assert!(forward_again.take_new_snapshot_enabled());
        assert!(forward_again.shares_holder_with(&root));

        root.complete(1);
        assert_eq!(forward_again.join().unwrap(), 1);
    }

    #[test]
    fn test_derived_stages_share_holder() {
        let root = ContextAwareCompletable::completed(1, Some(ContextSnapshot::empty()));
        let next = root.then_apply(|x| x + 1);
        assert!(next.shares_holder_with(&root));
        assert!(!next.take_new_snapshot_enabled());
        assert_eq!(next.join().unwrap(), 2);
    }

    #[test]
    fn test_race_gets_own_holder() {
        let a = ContextAwareCompletable::completed(1, Some(ContextSnapshot::empty()));
        let b = ContextAwareCompletable::<i32>::new();
        let race = a.apply_to_either(&b, |x| x * 10);
        assert!(!race.shares_holder_with(&a));
        assert_eq!(race.snapshot().id(), a.snapshot().id());
        assert_eq!(race.join().unwrap(), 10);
    }

    #[test]
    fn test_aggregate_uses_given_snapshot() {
        let snapshot = ContextSnapshot::empty();
        let stages = vec![
            ContextAwareCompletable::completed(1, None),
            ContextAwareCompletable::completed(2, None),
        ];
        let all = ContextAwareCompletable::all_of(Some(snapshot.clone()), stages);
        assert_eq!(all.snapshot().id(), snapshot.id());
        assert_eq!(all.join().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_run_async_inline_sees_snapshot() {
        let slot = Arc::new(ContextSlot::<String>::new("inline"));
        let registry = crate::context::ContextManagers::new();
        registry.register(slot.clone());
        let snapshot = {
            let _guard = slot.set("carried".to_string());
            registry.capture()
        };

        let seen = Arc::new(parking_lot::Mutex::new(None));
        let recorder = seen.clone();
        let worker_slot = slot.clone();
        let stage = ContextAwareCompletable::run_async(
            move || *recorder.lock() = worker_slot.get_cloned(),
            &InlineExecutor,
            Some(snapshot),
            false,
        );

        assert!(stage.is_done());
        assert_eq!(seen.lock().as_deref(), Some("carried"));
        assert!(slot.get().is_none());
    }

    #[test]
    fn test_restore_failure_fails_continuation() {
        let root = ContextAwareCompletable::completed(1, Some(broken_restore()));

        let applied = root.then_apply(|x| x + 1).join().unwrap_err();
        assert!(is_restore_failure(&applied));

        let handled = root.handle(|outcome| outcome.is_ok()).join().unwrap_err();
        assert!(is_restore_failure(&handled));

        let combined = root
            .then_combine(&Completable::completed(2), |a, b| a + b)
            .join()
            .unwrap_err();
        assert!(is_restore_failure(&combined));
    }

    #[test]
    fn test_restore_failure_fails_supplied_stage() {
        let stage =
            ContextAwareCompletable::supply_async(|| 5, &InlineExecutor, Some(broken_restore()), false);
        assert!(is_restore_failure(&stage.join().unwrap_err()));
    }

    #[test]
    fn test_own_failure_wins_over_restore_failure() {
        let root = ContextAwareCompletable::completed(1, Some(broken_restore()));

        let failed = root
            .then_try_apply(|_| -> anyhow::Result<u8> { anyhow::bail!("own failure") })
            .join()
            .unwrap_err();
        assert_eq!(failed.to_string(), "own failure");

        let original = ContextAwareCompletable::<u8>::with_snapshot(Some(broken_restore()));
        let observed = original.when_complete(|_| {});
        original.complete_exceptionally(CompletionError::Panicked("upstream".into()));
        assert!(matches!(
            observed.join(),
            Err(CompletionError::Panicked(ref message)) if message == "upstream"
        ));
    }
}
