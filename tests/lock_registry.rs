//! Cross-thread behaviour of the named lock registry: exclusion, reentrancy,
//! blocking waits, orphan healing and force acquisition.

use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel;
use taskmill::lock::LockRegistry;
use taskmill::TaskmillError;

const HOLD: Duration = Duration::from_secs(10);

#[test]
fn two_threads_exclude_each_other() {
    let registry = LockRegistry::new();
    let guard = registry.try_acquire("job-42", HOLD, false).unwrap().unwrap();

    let other = registry.clone();
    let contender =
        thread::spawn(move || other.try_acquire("job-42", HOLD, false).unwrap().is_some());
    assert!(!contender.join().unwrap());

    drop(guard);
    let other = registry.clone();
    let contender =
        thread::spawn(move || other.try_acquire("job-42", HOLD, false).unwrap().is_some());
    assert!(contender.join().unwrap());
}

#[test]
fn reentrant_hold_survives_nested_calls() {
    fn guarded_step(registry: &LockRegistry) {
        let _inner = registry.try_acquire("ledger", HOLD, true).unwrap().unwrap();
        // inner guard drops here; the outer hold must survive
    }

    let registry = LockRegistry::new();
    let outer = registry
        .acquire("ledger", HOLD, Duration::from_secs(1), true)
        .unwrap();
    guarded_step(&registry);
    guarded_step(&registry);
    assert!(registry.held_by_current_thread("ledger"));
    drop(outer);
    assert!(!registry.held_by_current_thread("ledger"));
    assert!(registry.is_empty());
}

#[test]
fn blocking_acquire_waits_for_release() {
    let registry = LockRegistry::new();
    let (ready_tx, ready_rx) = channel::bounded(0);
    let holder = {
        let registry = registry.clone();
        thread::spawn(move || {
            let guard = registry.try_acquire("batch", HOLD, false).unwrap().unwrap();
            ready_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(150));
            drop(guard);
        })
    };
    ready_rx.recv().unwrap();

    let started = Instant::now();
    let guard = registry
        .acquire("batch", HOLD, Duration::from_secs(5), false)
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(registry.held_by_current_thread("batch"));
    drop(guard);
    holder.join().unwrap();
}

#[test]
fn blocking_acquire_times_out() {
    let registry = LockRegistry::new();
    let (ready_tx, ready_rx) = channel::bounded(0);
    let (done_tx, done_rx) = channel::bounded::<()>(0);
    let holder = {
        let registry = registry.clone();
        thread::spawn(move || {
            let _guard = registry.try_acquire("busy", HOLD, false).unwrap().unwrap();
            ready_tx.send(()).unwrap();
            let _ = done_rx.recv();
        })
    };
    ready_rx.recv().unwrap();

    let err = registry
        .acquire("busy", HOLD, Duration::from_millis(120), false)
        .unwrap_err();
    assert!(matches!(err, TaskmillError::LockTimeout(_)));
    drop(done_tx);
    holder.join().unwrap();
}

#[test]
fn orphaned_lock_is_reclaimed() {
    let registry = LockRegistry::new();
    let other = registry.clone();
    thread::spawn(move || {
        let guard = other.try_acquire("crashy", HOLD, false).unwrap().unwrap();
        // a holder that dies without releasing
        std::mem::forget(guard);
    })
    .join()
    .unwrap();

    let info = registry.examine("crashy").unwrap();
    assert!(info.orphaned);

    let fresh = registry.try_acquire("crashy", HOLD, false).unwrap();
    assert!(fresh.is_some());
    assert!(!registry.examine("crashy").unwrap().orphaned);
}

#[test]
fn force_acquire_revokes_live_holder() {
    let registry = LockRegistry::new();
    let (ready_tx, ready_rx) = channel::bounded(0);
    let (check_tx, check_rx) = channel::bounded::<()>(0);
    let (revoked_tx, revoked_rx) = channel::bounded(0);
    let holder = {
        let registry = registry.clone();
        thread::spawn(move || {
            let guard = registry
                .try_acquire("contested", HOLD, false)
                .unwrap()
                .unwrap();
            ready_tx.send(()).unwrap();
            check_rx.recv().unwrap();
            revoked_tx.send(guard.is_revoked()).unwrap();
            // the stale guard's drop must not disturb the new holder
        })
    };
    ready_rx.recv().unwrap();

    let taken = registry.force_acquire("contested").unwrap();
    assert_eq!(taken.slug(), "contested");
    assert!(registry.held_by_current_thread("contested"));

    check_tx.send(()).unwrap();
    assert!(revoked_rx.recv().unwrap());
    holder.join().unwrap();
    assert!(registry.held_by_current_thread("contested"));
}
