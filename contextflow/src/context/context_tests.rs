//! Cross-cutting tests for capture, reactivation and restoration.

use super::*;
use crate::errors::ContextflowError;
use crate::observability::{clear_context_timer, set_context_timer, ContextOperation};
use crate::testing::{CollectingContextTimer, CountingContextManager, FailingContextManager};
use std::sync::{Arc, Barrier};
use std::thread;

fn local_registry() -> (ContextManagers, Arc<ContextSlot<String>>) {
    let registry = ContextManagers::new();
    let slot = Arc::new(ContextSlot::<String>::new("user"));
    registry.register(slot.clone());
    (registry, slot)
}

mod capture_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_capture_and_reactivate_on_other_thread() {
        let (registry, slot) = local_registry();
        let _guard = slot.set("alice".to_string());
        let snapshot = registry.capture();

        let worker_slot = slot.clone();
        let (inside, after) = thread::spawn(move || {
            let reactivation = snapshot.reactivate();
            let inside = worker_slot.get_cloned();
            reactivation.close().unwrap();
            (inside, worker_slot.get_cloned())
        })
        .join()
        .unwrap();

        assert_eq!(inside.as_deref(), Some("alice"));
        assert_eq!(after, None);
    }

    #[test]
    fn test_snapshot_is_immutable() {
        let (registry, slot) = local_registry();
        slot.replace(Some("before".to_string()));
        let snapshot = registry.capture();
        slot.replace(Some("after".to_string()));

        let seen = snapshot.run(|| slot.get_cloned());
        assert_eq!(seen.as_deref(), Some("before"));
        assert_eq!(slot.get_cloned().as_deref(), Some("after"));
        slot.clear().unwrap();
    }

    #[test]
    fn test_capture_skips_failing_manager() {
        let registry = ContextManagers::new();
        registry.register(Arc::new(FailingContextManager::new("broken").fail_on_capture()));
        registry.register(Arc::new(ContextSlot::<String>::new("healthy")));

        let snapshot = registry.capture();
        assert_eq!(snapshot.slot_names(), vec!["healthy"]);
    }

    #[test]
    fn test_snapshot_ids_are_unique() {
        let (registry, _slot) = local_registry();
        let first = registry.capture();
        let second = registry.capture();
        assert_ne!(first.id(), second.id());
        assert_eq!(first.clone().id(), first.id());
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = ContextSnapshot::empty();
        assert!(snapshot.is_empty());
        let reactivation = snapshot.reactivate();
        assert!(reactivation.is_empty());
        assert!(reactivation.close().is_ok());
    }
}

mod restore_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_restores_previous_value() {
        let (registry, slot) = local_registry();
        let _outer = slot.set("outer".to_string());
        let snapshot = {
            let _inner = slot.set("captured".to_string());
            registry.capture()
        };

        let reactivation = snapshot.reactivate();
        assert_eq!(slot.get_cloned().as_deref(), Some("captured"));
        slot.replace(Some("modified inside".to_string()));
        reactivation.close().unwrap();

        assert_eq!(slot.get_cloned().as_deref(), Some("outer"));
    }

    #[test]
    fn test_restores_on_panic() {
        let (registry, slot) = local_registry();
        let snapshot = {
            let _guard = slot.set("captured".to_string());
            registry.capture()
        };
        let _before = slot.set("before".to_string());

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            snapshot.run(|| {
                assert_eq!(slot.get_cloned().as_deref(), Some("captured"));
                panic!("delegate failed");
            })
        }));

        assert!(result.is_err());
        assert_eq!(slot.get_cloned().as_deref(), Some("before"));
    }

    #[test]
    fn test_drop_restores_without_close() {
        let (registry, slot) = local_registry();
        let snapshot = {
            let _guard = slot.set("captured".to_string());
            registry.capture()
        };

        {
            let _reactivation = snapshot.reactivate();
            assert_eq!(slot.get_cloned().as_deref(), Some("captured"));
        }
        assert_eq!(slot.get_cloned(), None);
    }

    #[test]
    fn test_close_attempts_every_slot() {
        let registry = ContextManagers::new();
        let slot = Arc::new(ContextSlot::<String>::new("healthy"));
        registry.register(Arc::new(FailingContextManager::new("first").fail_on_close()));
        registry.register(slot.clone());
        registry.register(Arc::new(FailingContextManager::new("last").fail_on_close()));

        let snapshot = {
            let _guard = slot.set("captured".to_string());
            registry.capture()
        };
        let reactivation = snapshot.reactivate();
        assert_eq!(reactivation.len(), 3);

        let err = reactivation.close().unwrap_err();
        let ContextflowError::Restore(restore) = err else {
            panic!("expected a restore error");
        };
        let failed: Vec<&str> = restore.failures.iter().map(|f| f.slot.as_str()).collect();
        assert_eq!(failed, vec!["last", "first"]);
        assert_eq!(slot.get_cloned(), None);
    }

    #[test]
    fn test_reactivate_skips_failing_slot() {
        let registry = ContextManagers::new();
        let slot = Arc::new(ContextSlot::<String>::new("healthy"));
        registry.register(Arc::new(FailingContextManager::new("broken").fail_on_activate()));
        registry.register(slot.clone());

        let snapshot = {
            let _guard = slot.set("captured".to_string());
            registry.capture()
        };
        let reactivation = snapshot.reactivate();
        assert_eq!(reactivation.len(), 1);
        assert_eq!(slot.get_cloned().as_deref(), Some("captured"));
        reactivation.close().unwrap();
    }

    #[test]
    fn test_reactivate_and_close_counts() {
        let registry = ContextManagers::new();
        let counting = Arc::new(CountingContextManager::new(Arc::new(
            ContextSlot::<String>::new("counted"),
        )));
        registry.register(counting.clone());

        let snapshot = registry.capture();
        snapshot.run(|| ());

        let counts = counting.counts();
        assert_eq!(counts.captures, 1);
        assert_eq!(counts.activations, 1);
        assert_eq!(counts.closes, 1);
    }
}

mod concurrency_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_concurrent_reactivation_is_isolated() {
        let registry = ContextManagers::new();
        let slot = Arc::new(ContextSlot::<String>::new("tenant"));
        registry.register(slot.clone());

        let snapshots: Vec<ContextSnapshot> = (0..4)
            .map(|i| {
                let _guard = slot.set(format!("tenant-{i}"));
                registry.capture()
            })
            .collect();

        let barrier = Arc::new(Barrier::new(snapshots.len()));
        let handles: Vec<_> = snapshots
            .into_iter()
            .enumerate()
            .map(|(i, snapshot)| {
                let slot = slot.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    snapshot.run(|| {
                        barrier.wait();
                        slot.replace(Some(format!("changed-{i}")));
                        barrier.wait();
                        slot.get_cloned()
                    });
                    assert_eq!(slot.get_cloned(), None);
                    snapshot.run(|| slot.get_cloned())
                })
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            let seen = handle.join().unwrap();
            assert_eq!(seen, Some(format!("tenant-{i}")));
        }
    }

    #[test]
    fn test_same_snapshot_on_many_threads() {
        let (registry, slot) = local_registry();
        let snapshot = {
            let _guard = slot.set("shared".to_string());
            registry.capture()
        };

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let snapshot = snapshot.clone();
                let slot = slot.clone();
                thread::spawn(move || snapshot.run(|| slot.get_cloned()))
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap().as_deref(), Some("shared"));
        }
    }
}

mod observability_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_timer_receives_capture_reactivate_and_close() {
        let timer = Arc::new(CollectingContextTimer::new());
        set_context_timer(timer.clone());

        let registry = ContextManagers::new();
        registry.register(Arc::new(FailingContextManager::new("broken").fail_on_close()));
        let snapshot = registry.capture();
        let result = snapshot.reactivate().close();

        clear_context_timer();

        assert!(result.is_err());
        let operations = timer.timed_operations();
        assert!(operations.contains(&ContextOperation::Capture));
        assert!(operations.contains(&ContextOperation::Reactivate));
        assert!(operations.contains(&ContextOperation::Close));
        assert!(timer
            .errors()
            .iter()
            .any(|(operation, _)| *operation == ContextOperation::Close));
    }
}
