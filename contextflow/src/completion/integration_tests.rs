//! End-to-end tests for context propagation through pipelines.

use super::*;
use crate::context::{ContextManagers, ContextSlot, ContextSnapshot};
use crate::errors::CompletionError;
use crate::executor::{Executor, ThreadExecutor, TokioExecutor};
use pretty_assertions::assert_eq;
use std::sync::{mpsc, Arc};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn worker() -> Arc<dyn Executor> {
    Arc::new(ThreadExecutor::new())
}

/// Runs the Parent/Child scenario and returns what stage 1 and stage 2 saw.
fn parent_child(take_new_snapshot: bool) -> (Option<String>, Option<String>) {
    init_tracing();
    let slot = ContextSlot::<String>::register("user");
    let _parent = slot.set("Parent".to_string());

    let stage_one_slot = slot.clone();
    let stage_one = ContextAwareCompletable::supply_async(
        move || {
            let seen = stage_one_slot.get_cloned();
            stage_one_slot.replace(Some("Child".to_string()));
            (seen, "done".to_string())
        },
        &ThreadExecutor::new(),
        None,
        take_new_snapshot,
    );

    let stage_two_slot = slot.clone();
    let stage_two = stage_one.then_apply(move |(seen_by_one, result)| {
        assert_eq!(result, "done");
        (seen_by_one, stage_two_slot.get_cloned())
    });

    let observed = stage_two.join().unwrap();
    assert_eq!(slot.get_cloned().as_deref(), Some("Parent"));
    observed
}

#[test]
fn test_parent_child_without_propagation() {
    let (stage_one, stage_two) = parent_child(false);
    assert_eq!(stage_one.as_deref(), Some("Parent"));
    assert_eq!(stage_two.as_deref(), Some("Parent"));
}

#[test]
fn test_parent_child_with_propagation() {
    let (stage_one, stage_two) = parent_child(true);
    assert_eq!(stage_one.as_deref(), Some("Parent"));
    assert_eq!(stage_two.as_deref(), Some("Child"));
}

fn chain_observes(take_new_snapshot: bool, toggles: usize) -> Option<String> {
    init_tracing();
    let slot = ContextSlot::<String>::register("chain");
    let _a = slot.set("A".to_string());

    let mut root = ContextAwareCompletable::<()>::new();
    for _ in 0..toggles {
        root = root.take_new_snapshot(take_new_snapshot);
    }

    let first_slot = slot.clone();
    let first = root.then_apply(move |()| {
        first_slot.replace(Some("B".to_string()));
    });
    let second_slot = slot.clone();
    let second = first.then_apply_async(move |()| second_slot.get_cloned(), &worker());

    root.complete(());
    let observed = second.join().unwrap();
    assert_eq!(slot.get_cloned().as_deref(), Some("A"));
    observed
}

#[test]
fn test_chain_propagation() {
    assert_eq!(chain_observes(true, 1).as_deref(), Some("B"));
    assert_eq!(chain_observes(false, 1).as_deref(), Some("A"));
}

#[test]
fn test_toggle_is_idempotent() {
    assert_eq!(chain_observes(true, 2), chain_observes(true, 1));
    assert_eq!(chain_observes(false, 2), chain_observes(false, 1));
}

#[test]
fn test_race_observes_winning_branch_and_leaves_root_alone() {
    let slot = ContextSlot::<String>::register("race");
    let _root = slot.set("root".to_string());

    let branch = ContextAwareCompletable::<String>::new().take_new_snapshot(true);
    let branch_slot = slot.clone();
    let branch_done = branch.then_apply(move |value| {
        branch_slot.replace(Some("A".to_string()));
        value
    });
    let loser = ContextAwareCompletable::<String>::new();

    branch.complete("a".to_string());

    let race_slot = slot.clone();
    let race = branch_done.apply_to_either(&loser, move |value| {
        let seen = race_slot.get_cloned();
        race_slot.replace(Some("race".to_string()));
        (value, seen)
    });

    assert_eq!(race.join().unwrap(), ("a".to_string(), Some("A".to_string())));
    assert!(!race.shares_holder_with(&branch_done));

    let root_sees = branch_done.snapshot().run(|| slot.get_cloned());
    let race_sees = race.snapshot().run(|| slot.get_cloned());
    assert_eq!(root_sees.as_deref(), Some("A"));
    assert_eq!(race_sees.as_deref(), Some("race"));
    assert_eq!(slot.get_cloned().as_deref(), Some("root"));
}

#[test]
fn test_chain_propagation_uses_snapshot_registry() {
    let registry = ContextManagers::new();
    let slot = Arc::new(ContextSlot::<String>::new("forward-local"));
    registry.register(slot.clone());
    let snapshot = {
        let _guard = slot.set("A".to_string());
        registry.capture()
    };

    let root = ContextAwareCompletable::completed((), Some(snapshot)).take_new_snapshot(true);
    let first_slot = slot.clone();
    let first = root.then_apply(move |()| {
        first_slot.replace(Some("B".to_string()));
    });
    let second_slot = slot.clone();
    let second = first.then_apply_async(move |()| second_slot.get_cloned(), &worker());

    assert_eq!(second.join().unwrap().as_deref(), Some("B"));
    assert!(slot.get().is_none());
}

#[test]
fn test_race_between_propagating_branches_keeps_holders_apart() {
    init_tracing();
    let slot = ContextSlot::<String>::register("race-branches");
    let _root = slot.set("root".to_string());

    let branch = |value: &'static str, gate: mpsc::Receiver<()>| {
        let slot = slot.clone();
        ContextAwareCompletable::supply_async(
            move || {
                gate.recv().unwrap();
                slot.replace(Some(value.to_string()));
                value.to_string()
            },
            &ThreadExecutor::new(),
            None,
            true,
        )
    };
    let (open_left, left_gate) = mpsc::channel();
    let (open_right, right_gate) = mpsc::channel();
    let left = branch("left", left_gate);
    let right = branch("right", right_gate);

    let race_slot = slot.clone();
    let race = left.apply_to_either(&right, move |value| {
        let seen = race_slot.get_cloned();
        race_slot.replace(Some("winner".to_string()));
        (value, seen)
    });

    open_left.send(()).unwrap();
    assert_eq!(race.join().unwrap(), ("left".to_string(), Some("root".to_string())));
    open_right.send(()).unwrap();
    assert_eq!(right.join().unwrap(), "right");

    let sees = |stage: ContextSnapshot| stage.run(|| slot.get_cloned());
    assert_eq!(sees(left.snapshot()).as_deref(), Some("left"));
    assert_eq!(sees(right.snapshot()).as_deref(), Some("right"));
    assert_eq!(sees(race.snapshot()).as_deref(), Some("winner"));
    assert!(!race.shares_holder_with(&left));
    assert!(!race.shares_holder_with(&right));
    assert_eq!(slot.get_cloned().as_deref(), Some("root"));
}

#[test]
fn test_combine_runs_in_carried_context() {
    let slot = ContextSlot::<String>::register("combine");
    let snapshot = {
        let _guard = slot.set("carried".to_string());
        ContextSnapshot::capture()
    };

    let left = ContextAwareCompletable::supply_async(|| 2, worker().as_ref(), Some(snapshot), false);
    let right = Completable::supply_async(|| 3, worker().as_ref());
    let combine_slot = slot.clone();
    let combined = left.then_combine(&right, move |a, b| (a * b, combine_slot.get_cloned()));

    assert_eq!(combined.join().unwrap(), (6, Some("carried".to_string())));
}

#[test]
fn test_all_of_can_continue_from_a_branch() {
    let slot = ContextSlot::<String>::register("aggregate");
    let _outer = slot.set("outer".to_string());

    let branch_slot = slot.clone();
    let branch = ContextAwareCompletable::supply_async(
        move || {
            branch_slot.replace(Some("branch".to_string()));
            1
        },
        &ThreadExecutor::new(),
        None,
        true,
    );
    let other = ContextAwareCompletable::completed(2, None);
    branch.join().unwrap();

    let fresh = ContextAwareCompletable::all_of(None, vec![branch.clone(), other.clone()]);
    let adopted = ContextAwareCompletable::all_of(Some(branch.snapshot()), vec![branch, other]);

    let fresh_slot = slot.clone();
    let fresh_seen = fresh.then_apply(move |values| (values, fresh_slot.get_cloned()));
    let adopted_slot = slot.clone();
    let adopted_seen = adopted.then_apply(move |values| (values, adopted_slot.get_cloned()));

    assert_eq!(fresh_seen.join().unwrap(), (vec![1, 2], Some("outer".to_string())));
    assert_eq!(adopted_seen.join().unwrap(), (vec![1, 2], Some("branch".to_string())));
}

#[test]
fn test_failure_reaches_handler_in_context() {
    let slot = ContextSlot::<String>::register("failure");
    let _guard = slot.set("ctx".to_string());

    let root_slot = slot.clone();
    let root = ContextAwareCompletable::<u32>::completed(3, None)
        .then_try_apply(|x| -> anyhow::Result<u32> {
            anyhow::ensure!(x > 10, "too small");
            Ok(x)
        })
        .handle(move |outcome| match outcome {
            Ok(value) => format!("ok {value}"),
            Err(err) => format!("{err} in {:?}", root_slot.get_cloned()),
        });

    assert_eq!(root.join().unwrap(), "too small in Some(\"ctx\")");
}

#[test]
fn test_cancelled_root_skips_continuations() {
    let root = ContextAwareCompletable::<u8>::new();
    let next = root.then_apply(|x| x + 1);
    root.cancel();
    assert!(matches!(next.join(), Err(CompletionError::Cancelled)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_await_on_tokio_executor() {
    let slot = ContextSlot::<String>::register("tokio");
    let snapshot = {
        let _guard = slot.set("async".to_string());
        ContextSnapshot::capture()
    };
    let executor: Arc<dyn Executor> = match TokioExecutor::try_current() {
        Some(executor) => Arc::new(executor),
        None => panic!("test runs inside a tokio runtime"),
    };

    let task_slot = slot.clone();
    let stage = ContextAwareCompletable::supply_async(
        move || task_slot.get_cloned(),
        executor.as_ref(),
        Some(snapshot),
        false,
    );
    let next_slot = slot.clone();
    let next = stage.then_apply_async(move |seen| (seen, next_slot.get_cloned()), &executor);

    let (first, second) = next.await.unwrap();
    assert_eq!(first.as_deref(), Some("async"));
    assert_eq!(second.as_deref(), Some("async"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_await_many_branches() {
    let slot = ContextSlot::<String>::register("branches");
    let _guard = slot.set("fan-out".to_string());

    let branches: Vec<_> = (0..4)
        .map(|i| {
            let slot = slot.clone();
            ContextAwareCompletable::supply_async(
                move || format!("{i}:{}", slot.get_cloned().unwrap_or_default()),
                &ThreadExecutor::new(),
                None,
                false,
            )
        })
        .collect();

    let results: Vec<String> = futures::future::join_all(branches)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();
    assert_eq!(results, vec!["0:fan-out", "1:fan-out", "2:fan-out", "3:fan-out"]);
}

#[test]
fn test_block_on_completed_stage() {
    let stage = ContextAwareCompletable::completed(5u8, Some(ContextSnapshot::empty()))
        .then_apply(|x| x * 2);
    assert_eq!(tokio_test::block_on(stage).unwrap(), 10);
}
