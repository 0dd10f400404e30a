//! An eagerly completed deferred computation with completion callbacks.

use crate::errors::CompletionError;
use crate::executor::Executor;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};
use tracing::warn;

/// The result a [`Completable`] finishes with.
pub type Outcome<T> = Result<T, CompletionError>;

type Callback<T> = Box<dyn FnOnce(&Outcome<T>) + Send>;

struct State<T> {
    outcome: Option<Outcome<T>>,
    callbacks: Vec<Callback<T>>,
    wakers: Vec<Waker>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    completed: Condvar,
}

/// A computation that completes at most once, with a value or a failure.
///
/// Dependent stages are registered as callbacks and run on the thread that
/// completes this stage, or are submitted to an executor by the `_async`
/// variants. A panic inside a continuation completes the dependent stage with
/// [`CompletionError::Panicked`]. A `Completable` can also be awaited.
///
/// # Example
///
/// ```rust
/// use contextflow::prelude::*;
///
/// let price = Completable::supply_async(|| 40, &ThreadExecutor::new());
/// let total = price.then_apply(|p| p + 2);
/// assert_eq!(total.join().unwrap(), 42);
/// ```
pub struct Completable<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Completable<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> AsRef<Self> for Completable<T> {
    fn as_ref(&self) -> &Self {
        self
    }
}

fn guarded<U>(f: impl FnOnce() -> Outcome<U>) -> Outcome<U> {
    catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(CompletionError::from_panic(payload.as_ref())))
}

fn run_callback<T>(callback: Callback<T>, outcome: &Outcome<T>) {
    if catch_unwind(AssertUnwindSafe(|| callback(outcome))).is_err() {
        warn!("Completion callback panicked");
    }
}

/// Completes the target with a rejection if the task is dropped unexecuted.
struct DispatchGuard<U: Clone + Send + Sync + 'static> {
    target: Option<Completable<U>>,
}

impl<U: Clone + Send + Sync + 'static> Drop for DispatchGuard<U> {
    fn drop(&mut self) {
        if let Some(target) = self.target.take() {
            warn!("Executor dropped a task without running it");
            target.complete_with(Err(CompletionError::Rejected(
                "task was dropped before it ran".to_string(),
            )));
        }
    }
}

/// Runs `f` on `executor` and completes `target` with its outcome.
pub(crate) fn dispatch<U>(
    executor: &dyn Executor,
    target: Completable<U>,
    f: impl FnOnce() -> Outcome<U> + Send + 'static,
) where
    U: Clone + Send + Sync + 'static,
{
    let guard = DispatchGuard {
        target: Some(target),
    };
    executor.execute(Box::new(move || {
        let mut guard = guard;
        if let Some(target) = guard.target.take() {
            if !target.is_done() {
                target.complete_with(guarded(f));
            }
        }
    }));
}

impl<T: Clone + Send + Sync + 'static> Default for Completable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> Completable<T> {
    /// Creates an incomplete stage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    outcome: None,
                    callbacks: Vec::new(),
                    wakers: Vec::new(),
                }),
                completed: Condvar::new(),
            }),
        }
    }

    /// Creates a stage already completed with `value`.
    #[must_use]
    pub fn completed(value: T) -> Self {
        let stage = Self::new();
        stage.complete(value);
        stage
    }

    /// Creates a stage already completed with `error`.
    #[must_use]
    pub fn failed(error: CompletionError) -> Self {
        let stage = Self::new();
        stage.complete_exceptionally(error);
        stage
    }

    /// Runs `f` on `executor` and completes with its result.
    pub fn supply_async<F>(f: F, executor: &dyn Executor) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let stage = Self::new();
        dispatch(executor, stage.clone(), move || Ok(f()));
        stage
    }

    /// Completes with `value` unless already complete.
    ///
    /// Returns true if this call completed the stage.
    pub fn complete(&self, value: T) -> bool {
        self.complete_with(Ok(value))
    }

    /// Completes with `error` unless already complete.
    pub fn complete_exceptionally(&self, error: CompletionError) -> bool {
        self.complete_with(Err(error))
    }

    /// Completes with [`CompletionError::Cancelled`] unless already complete.
    ///
    /// Dependent stages fail without running their continuations.
    pub fn cancel(&self) -> bool {
        self.complete_with(Err(CompletionError::Cancelled))
    }

    pub(crate) fn complete_with(&self, outcome: Outcome<T>) -> bool {
        let mut state = self.shared.state.lock();
        if state.outcome.is_some() {
            return false;
        }
        let callbacks = std::mem::take(&mut state.callbacks);
        let for_callbacks = (!callbacks.is_empty()).then(|| outcome.clone());
        state.outcome = Some(outcome);
        let wakers = std::mem::take(&mut state.wakers);
        drop(state);

        self.shared.completed.notify_all();
        for waker in wakers {
            waker.wake();
        }
        if let Some(outcome) = for_callbacks {
            for callback in callbacks {
                run_callback(callback, &outcome);
            }
        }
        true
    }

    /// Returns true once completed in any way.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.shared.state.lock().outcome.is_some()
    }

    /// Returns true if completed with a failure, including cancellation.
    #[must_use]
    pub fn is_completed_exceptionally(&self) -> bool {
        matches!(self.shared.state.lock().outcome, Some(Err(_)))
    }

    /// Returns true if cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.shared.state.lock().outcome,
            Some(Err(CompletionError::Cancelled))
        )
    }

    /// Returns the outcome if already complete.
    #[must_use]
    pub fn outcome(&self) -> Option<Outcome<T>> {
        self.shared.state.lock().outcome.clone()
    }

    /// Returns the outcome if complete, otherwise `Ok(if_absent)`.
    pub fn now(&self, if_absent: T) -> Outcome<T> {
        self.outcome().unwrap_or(Ok(if_absent))
    }

    /// Blocks until complete.
    pub fn join(&self) -> Outcome<T> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            self.shared.completed.wait(&mut state);
        }
    }

    /// Blocks until complete or until `timeout` elapses.
    ///
    /// Returns [`CompletionError::TimedOut`] on timeout; the stage itself is
    /// left untouched.
    pub fn join_timeout(&self, timeout: Duration) -> Outcome<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            if self
                .shared
                .completed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state
                    .outcome
                    .clone()
                    .unwrap_or(Err(CompletionError::TimedOut));
            }
        }
    }

    /// Calls `f` with the outcome once complete.
    ///
    /// Runs immediately on the calling thread if already complete.
    pub fn on_complete(&self, f: impl FnOnce(&Outcome<T>) + Send + 'static) {
        let mut state = self.shared.state.lock();
        match state.outcome.clone() {
            Some(outcome) => {
                drop(state);
                run_callback(Box::new(f), &outcome);
            }
            None => state.callbacks.push(Box::new(f)),
        }
    }

    /// Completes a dependent stage with `f` applied to this stage's outcome.
    pub(crate) fn chain<U, F>(&self, executor: Option<&Arc<dyn Executor>>, f: F) -> Completable<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(Outcome<T>) -> Outcome<U> + Send + 'static,
    {
        let dependent = Completable::new();
        let target = dependent.clone();
        let executor = executor.cloned();
        self.on_complete(move |outcome| {
            if target.is_done() {
                return;
            }
            let outcome = outcome.clone();
            match executor {
                Some(executor) => dispatch(executor.as_ref(), target, move || f(outcome)),
                None => {
                    target.complete_with(guarded(move || f(outcome)));
                }
            }
        });
        dependent
    }

    pub(crate) fn both<U>(&self, other: &Completable<U>) -> Completable<(T, U)>
    where
        U: Clone + Send + Sync + 'static,
    {
        let pair = Completable::new();
        let target = pair.clone();
        let other = other.clone();
        self.on_complete(move |first| {
            let first = first.clone();
            other.on_complete(move |second| {
                let combined = match (first, second) {
                    (Ok(a), Ok(b)) => Ok((a, b.clone())),
                    (Err(err), _) => Err(err),
                    (Ok(_), Err(err)) => Err(err.clone()),
                };
                target.complete_with(combined);
            });
        });
        pair
    }

    pub(crate) fn either(&self, other: &Completable<T>) -> Completable<T> {
        let winner = Completable::new();
        for stage in [self, other] {
            let target = winner.clone();
            stage.on_complete(move |outcome| {
                target.complete_with(outcome.clone());
            });
        }
        winner
    }

    /// Transforms the value.
    pub fn then_apply<U, F>(&self, f: F) -> Completable<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.chain(None, move |outcome| outcome.map(f))
    }

    /// Transforms the value on `executor`.
    pub fn then_apply_async<U, F>(&self, f: F, executor: &Arc<dyn Executor>) -> Completable<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.chain(Some(executor), move |outcome| outcome.map(f))
    }

    /// Transforms the value with a fallible function.
    pub fn then_try_apply<U, F>(&self, f: F) -> Completable<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> anyhow::Result<U> + Send + 'static,
    {
        self.chain(None, move |outcome| {
            outcome.and_then(|value| f(value).map_err(CompletionError::from_anyhow))
        })
    }

    /// Transforms the value with a fallible function on `executor`.
    pub fn then_try_apply_async<U, F>(&self, f: F, executor: &Arc<dyn Executor>) -> Completable<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> anyhow::Result<U> + Send + 'static,
    {
        self.chain(Some(executor), move |outcome| {
            outcome.and_then(|value| f(value).map_err(CompletionError::from_anyhow))
        })
    }

    /// Consumes the value.
    pub fn then_accept<F>(&self, f: F) -> Completable<()>
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.chain(None, move |outcome| outcome.map(f))
    }

    /// Consumes the value on `executor`.
    pub fn then_accept_async<F>(&self, f: F, executor: &Arc<dyn Executor>) -> Completable<()>
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.chain(Some(executor), move |outcome| outcome.map(f))
    }

    /// Runs `f` after a successful completion.
    pub fn then_run<F>(&self, f: F) -> Completable<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.chain(None, move |outcome| outcome.map(|_| f()))
    }

    /// Runs `f` on `executor` after a successful completion.
    pub fn then_run_async<F>(&self, f: F, executor: &Arc<dyn Executor>) -> Completable<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.chain(Some(executor), move |outcome| outcome.map(|_| f()))
    }

    /// Continues with the stage returned by `f`.
    pub fn then_compose<U, S, F>(&self, f: F) -> Completable<U>
    where
        U: Clone + Send + Sync + 'static,
        S: Into<Completable<U>>,
        F: FnOnce(T) -> S + Send + 'static,
    {
        flatten(self.chain(None, move |outcome| {
            outcome.map(|value| Into::<Completable<U>>::into(f(value)))
        }))
    }

    /// Continues with the stage returned by `f`, calling it on `executor`.
    pub fn then_compose_async<U, S, F>(&self, f: F, executor: &Arc<dyn Executor>) -> Completable<U>
    where
        U: Clone + Send + Sync + 'static,
        S: Into<Completable<U>>,
        F: FnOnce(T) -> S + Send + 'static,
    {
        flatten(self.chain(Some(executor), move |outcome| {
            outcome.map(|value| Into::<Completable<U>>::into(f(value)))
        }))
    }

    /// Maps the outcome, successful or not, to a new value.
    pub fn handle<U, F>(&self, f: F) -> Completable<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(Outcome<T>) -> U + Send + 'static,
    {
        self.chain(None, move |outcome| Ok(f(outcome)))
    }

    /// Maps the outcome to a new value on `executor`.
    pub fn handle_async<U, F>(&self, f: F, executor: &Arc<dyn Executor>) -> Completable<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(Outcome<T>) -> U + Send + 'static,
    {
        self.chain(Some(executor), move |outcome| Ok(f(outcome)))
    }

    /// Observes the outcome and passes it through.
    ///
    /// If `f` panics after a successful completion, the dependent stage fails
    /// with the panic; after a failed completion the original failure is kept.
    pub fn when_complete<F>(&self, f: F) -> Completable<T>
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        self.chain(None, move |outcome| observe(outcome, f))
    }

    /// Observes the outcome on `executor` and passes it through.
    pub fn when_complete_async<F>(&self, f: F, executor: &Arc<dyn Executor>) -> Completable<T>
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        self.chain(Some(executor), move |outcome| observe(outcome, f))
    }

    /// Recovers from a failure.
    pub fn exceptionally<F>(&self, f: F) -> Completable<T>
    where
        F: FnOnce(CompletionError) -> T + Send + 'static,
    {
        self.chain(None, move |outcome| outcome.or_else(|err| Ok(f(err))))
    }

    /// Recovers from a failure on `executor`.
    pub fn exceptionally_async<F>(&self, f: F, executor: &Arc<dyn Executor>) -> Completable<T>
    where
        F: FnOnce(CompletionError) -> T + Send + 'static,
    {
        self.chain(Some(executor), move |outcome| outcome.or_else(|err| Ok(f(err))))
    }

    /// Combines this value with `other`'s once both are complete.
    pub fn then_combine<U, V, F>(&self, other: &impl AsRef<Completable<U>>, f: F) -> Completable<V>
    where
        U: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        F: FnOnce(T, U) -> V + Send + 'static,
    {
        self.both(other.as_ref())
            .chain(None, move |outcome| outcome.map(|(a, b)| f(a, b)))
    }

    /// Combines this value with `other`'s on `executor`.
    pub fn then_combine_async<U, V, F>(
        &self,
        other: &impl AsRef<Completable<U>>,
        f: F,
        executor: &Arc<dyn Executor>,
    ) -> Completable<V>
    where
        U: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        F: FnOnce(T, U) -> V + Send + 'static,
    {
        self.both(other.as_ref())
            .chain(Some(executor), move |outcome| outcome.map(|(a, b)| f(a, b)))
    }

    /// Consumes this value and `other`'s once both are complete.
    pub fn then_accept_both<U, F>(&self, other: &impl AsRef<Completable<U>>, f: F) -> Completable<()>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T, U) + Send + 'static,
    {
        self.then_combine(other, f)
    }

    /// Consumes both values on `executor`.
    pub fn then_accept_both_async<U, F>(
        &self,
        other: &impl AsRef<Completable<U>>,
        f: F,
        executor: &Arc<dyn Executor>,
    ) -> Completable<()>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T, U) + Send + 'static,
    {
        self.then_combine_async(other, f, executor)
    }

    /// Runs `f` once both stages completed successfully.
    pub fn run_after_both<U, F>(&self, other: &impl AsRef<Completable<U>>, f: F) -> Completable<()>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce() + Send + 'static,
    {
        self.then_combine(other, move |_, _| f())
    }

    /// Runs `f` on `executor` once both stages completed successfully.
    pub fn run_after_both_async<U, F>(
        &self,
        other: &impl AsRef<Completable<U>>,
        f: F,
        executor: &Arc<dyn Executor>,
    ) -> Completable<()>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce() + Send + 'static,
    {
        self.then_combine_async(other, move |_, _| f(), executor)
    }

    /// Transforms whichever of this stage and `other` completes first.
    pub fn apply_to_either<U, F>(&self, other: &impl AsRef<Completable<T>>, f: F) -> Completable<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.either(other.as_ref()).then_apply(f)
    }

    /// Transforms the first completion on `executor`.
    pub fn apply_to_either_async<U, F>(
        &self,
        other: &impl AsRef<Completable<T>>,
        f: F,
        executor: &Arc<dyn Executor>,
    ) -> Completable<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.either(other.as_ref()).then_apply_async(f, executor)
    }

    /// Consumes whichever value arrives first.
    pub fn accept_either<F>(&self, other: &impl AsRef<Completable<T>>, f: F) -> Completable<()>
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.either(other.as_ref()).then_accept(f)
    }

    /// Consumes the first value on `executor`.
    pub fn accept_either_async<F>(
        &self,
        other: &impl AsRef<Completable<T>>,
        f: F,
        executor: &Arc<dyn Executor>,
    ) -> Completable<()>
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.either(other.as_ref()).then_accept_async(f, executor)
    }

    /// Runs `f` after whichever stage completes first.
    pub fn run_after_either<F>(&self, other: &impl AsRef<Completable<T>>, f: F) -> Completable<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.either(other.as_ref()).then_run(f)
    }

    /// Runs `f` on `executor` after whichever stage completes first.
    pub fn run_after_either_async<F>(
        &self,
        other: &impl AsRef<Completable<T>>,
        f: F,
        executor: &Arc<dyn Executor>,
    ) -> Completable<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.either(other.as_ref()).then_run_async(f, executor)
    }

    /// Completes once every stage has completed.
    ///
    /// Fails with the first failure in iteration order if any stage failed.
    /// Completes immediately with an empty vector if there are no stages.
    pub fn all_of(stages: impl IntoIterator<Item = Self>) -> Completable<Vec<T>> {
        let stages: Vec<Self> = stages.into_iter().collect();
        let all = Completable::new();
        if stages.is_empty() {
            all.complete(Vec::new());
            return all;
        }

        let outcomes: Arc<Mutex<Vec<Option<Outcome<T>>>>> =
            Arc::new(Mutex::new(vec![None; stages.len()]));
        let remaining = Arc::new(AtomicUsize::new(stages.len()));
        for (index, stage) in stages.iter().enumerate() {
            let outcomes = outcomes.clone();
            let remaining = remaining.clone();
            let target = all.clone();
            stage.on_complete(move |outcome| {
                outcomes.lock()[index] = Some(outcome.clone());
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let collected: Outcome<Vec<T>> = std::mem::take(&mut *outcomes.lock())
                        .into_iter()
                        .map(|outcome| outcome.unwrap_or(Err(CompletionError::Cancelled)))
                        .collect();
                    target.complete_with(collected);
                }
            });
        }
        all
    }

    /// Completes with whichever stage completes first.
    ///
    /// Never completes if there are no stages.
    pub fn any_of(stages: impl IntoIterator<Item = Self>) -> Self {
        let any = Self::new();
        for stage in stages {
            let target = any.clone();
            stage.on_complete(move |outcome| {
                target.complete_with(outcome.clone());
            });
        }
        any
    }
}

impl Completable<()> {
    /// Runs `f` on `executor`.
    pub fn run_async<F>(f: F, executor: &dyn Executor) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::supply_async(f, executor)
    }
}

pub(crate) fn observe<T, F>(outcome: Outcome<T>, f: F) -> Outcome<T>
where
    F: FnOnce(&Outcome<T>),
{
    match catch_unwind(AssertUnwindSafe(|| f(&outcome))) {
        Ok(()) => outcome,
        Err(_) if outcome.is_err() => outcome,
        Err(payload) => Err(CompletionError::from_panic(payload.as_ref())),
    }
}

pub(crate) fn flatten<U>(nested: Completable<Completable<U>>) -> Completable<U>
where
    U: Clone + Send + Sync + 'static,
{
    let flat = Completable::new();
    let target = flat.clone();
    nested.on_complete(move |outcome| match outcome {
        Ok(inner) => inner.on_complete(move |inner_outcome| {
            target.complete_with(inner_outcome.clone());
        }),
        Err(err) => {
            target.complete_with(Err(err.clone()));
        }
    });
    flat
}

impl<T: Clone> Future for Completable<T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.state.lock();
        if let Some(outcome) = &state.outcome {
            return Poll::Ready(outcome.clone());
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl<T> fmt::Debug for Completable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match &self.shared.state.lock().outcome {
            None => "pending",
            Some(Ok(_)) => "completed",
            Some(Err(CompletionError::Cancelled)) => "cancelled",
            Some(Err(_)) => "failed",
        };
        f.debug_struct("Completable").field("status", &status).finish()
    }
}
