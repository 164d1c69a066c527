//! End-to-end runner behaviour: de-duplication, bounded history,
//! cancellation, timeouts, shutdown and the dump/reload cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel;
use taskmill::config::RunnerConfig;
use taskmill::runner::TaskRunner;
use taskmill::task::{TaskDef, TaskSpec, TaskStatus};
use taskmill::TaskmillError;

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}

#[test]
fn duplicate_key_is_rejected_until_the_first_finishes() {
    let runner = TaskRunner::new("dedup", 2).unwrap();
    let (release_tx, release_rx) = channel::bounded::<()>(0);
    let first = runner
        .submit(TaskDef::new("ping", move |_ctx| {
            release_rx.recv()?;
            Ok(())
        }))
        .unwrap();

    let dup = runner.submit(TaskDef::new("ping", |_ctx| Ok(()))).unwrap_err();
    assert!(matches!(dup, TaskmillError::DuplicateTask(_)));
    assert!(runner
        .submit_if_absent(TaskDef::new("ping", |_ctx| Ok(())))
        .unwrap()
        .is_none());
    assert!(runner.has_task("ping"));

    release_tx.send(()).unwrap();
    assert!(first.wait(Duration::from_secs(5)));
    assert!(wait_until(Duration::from_secs(5), || !runner.has_task("ping")));

    // the identity is free again once the first instance finished
    let again = runner.submit(TaskDef::new("ping", |_ctx| Ok(()))).unwrap();
    assert!(again.wait(Duration::from_secs(5)));
    assert_eq!(again.status(), TaskStatus::Done);
}

#[test]
fn done_history_is_bounded() {
    let runner = TaskRunner::with_config(
        "history",
        RunnerConfig {
            threads: 1,
            history: 3,
            ..RunnerConfig::default()
        },
    )
    .unwrap();
    for i in 0..6 {
        let handle = runner
            .submit(TaskDef::new(format!("job-{i}"), |_ctx| Ok(())))
            .unwrap();
        assert!(handle.wait(Duration::from_secs(5)));
    }
    assert!(wait_until(Duration::from_secs(5), || runner.queue_size() == 0));

    let done = runner.done();
    assert_eq!(done.len(), 3);
    // oldest first, oldest evicted
    assert_eq!(done[0].name, "job-3");
    assert_eq!(done[2].name, "job-5");
}

#[test]
fn find_task_and_forget_cover_finished_tasks() {
    let runner = TaskRunner::new("lookup", 1).unwrap();
    let handle = runner.submit(TaskDef::new("reindex", |_ctx| Ok(()))).unwrap();
    assert!(handle.wait(Duration::from_secs(5)));
    assert!(wait_until(Duration::from_secs(5), || runner.queue_size() == 0));

    let record = runner.find_task("reindex").unwrap();
    assert_eq!(record.status, TaskStatus::Done);

    assert!(runner.forget("reindex"));
    assert!(runner.find_task("reindex").is_none());
    assert!(!runner.forget("reindex"));
}

#[test]
fn cancelling_a_waiting_task_skips_it() {
    let runner = TaskRunner::new("cancel-waiting", 1).unwrap();
    let (release_tx, release_rx) = channel::bounded::<()>(0);
    let blocker = runner
        .submit(TaskDef::new("blocker", move |_ctx| {
            release_rx.recv()?;
            Ok(())
        }))
        .unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    let r = Arc::clone(&ran);
    let waiting = runner
        .submit(TaskDef::new("victim", move |_ctx| {
            r.store(true, Ordering::SeqCst);
            Ok(())
        }))
        .unwrap();
    waiting.cancel();
    assert_eq!(waiting.status(), TaskStatus::Cancelled);
    // terminal tasks never linger in the todo bookkeeping
    assert!(!runner.has_task("victim"));

    release_tx.send(()).unwrap();
    assert!(blocker.wait(Duration::from_secs(5)));
    assert!(wait_until(Duration::from_secs(5), || runner.queue_size() == 0));
    // the cancelled task was skipped over, not run
    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn cancelled_waiting_task_frees_its_identity_immediately() {
    let runner = TaskRunner::new("cancel-free", 1).unwrap();
    let (release_tx, release_rx) = channel::bounded::<()>(0);
    let blocker = runner
        .submit(TaskDef::new("blocker", move |_ctx| {
            release_rx.recv()?;
            Ok(())
        }))
        .unwrap();

    let victim = runner.submit(TaskDef::new("victim", |_ctx| Ok(()))).unwrap();
    victim.cancel();
    assert_eq!(victim.status(), TaskStatus::Cancelled);
    assert!(!runner.has_task("victim"));
    assert_eq!(
        runner.find_task("victim").unwrap().status,
        TaskStatus::Cancelled
    );

    // the identity is free again right away, while the pool is still busy
    let replacement = runner.submit(TaskDef::new("victim", |_ctx| Ok(()))).unwrap();

    release_tx.send(()).unwrap();
    assert!(blocker.wait(Duration::from_secs(5)));
    assert!(replacement.wait(Duration::from_secs(5)));
    assert_eq!(replacement.status(), TaskStatus::Done);

    // the skipped job closed the cancelled task without a second done record
    assert!(wait_until(Duration::from_secs(5), || runner.queue_size() == 0));
    let cancelled = runner
        .done()
        .iter()
        .filter(|r| r.status == TaskStatus::Cancelled)
        .count();
    assert_eq!(cancelled, 1);
}

#[test]
fn cancelling_a_running_task_stops_it_cooperatively() {
    let runner = TaskRunner::new("cancel-running", 1).unwrap();
    let (started_tx, started_rx) = channel::bounded::<()>(0);
    let handle = runner
        .submit(TaskDef::new("spinner", move |ctx| {
            started_tx.send(())?;
            while !ctx.is_stopped() {
                std::thread::sleep(Duration::from_millis(5));
            }
            ctx.checkpoint()?;
            Ok(())
        }))
        .unwrap();
    started_rx.recv().unwrap();

    handle.cancel();
    assert!(handle.wait(Duration::from_secs(5)));
    assert_eq!(handle.status(), TaskStatus::Cancelled);
}

#[test]
fn overrunning_task_times_out_as_error() {
    let runner = TaskRunner::new("timeouts", 1).unwrap();
    let handle = runner
        .submit(
            TaskDef::new("sluggish", |ctx| {
                while !ctx.is_stopped() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                ctx.checkpoint()?;
                Ok(())
            })
            .max_runtime(Duration::from_millis(80)),
        )
        .unwrap();

    assert!(handle.wait(Duration::from_secs(5)));
    assert_eq!(handle.status(), TaskStatus::Error);
    assert!(handle
        .error()
        .unwrap()
        .to_string()
        .contains("max runtime"));
}

#[test]
fn shutdown_now_cancels_waiting_work() {
    let runner = TaskRunner::new("shutdown", 1).unwrap();
    let (started_tx, started_rx) = channel::bounded::<()>(0);
    let running = runner
        .submit(TaskDef::new("in-flight", move |ctx| {
            started_tx.send(())?;
            while !ctx.is_stopped() {
                std::thread::sleep(Duration::from_millis(5));
            }
            ctx.checkpoint()?;
            Ok(())
        }))
        .unwrap();
    let queued = runner.submit(TaskDef::new("queued", |_ctx| Ok(()))).unwrap();
    started_rx.recv().unwrap();

    let never_ran = runner.shutdown_now();
    assert_eq!(never_ran.len(), 1);
    assert_eq!(never_ran[0].name, "queued");
    assert_eq!(queued.status(), TaskStatus::Cancelled);

    assert!(running.wait(Duration::from_secs(5)));
    assert_eq!(running.status(), TaskStatus::Cancelled);
    assert!(runner.await_termination(Duration::from_secs(5)));
    assert!(matches!(
        runner.submit(TaskDef::new("late", |_ctx| Ok(()))),
        Err(TaskmillError::Shutdown)
    ));
}

#[test]
fn flush_to_disk_and_load_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let dump_path = dir.path().join("pending.json");

    let runner = TaskRunner::with_config(
        "dumper",
        RunnerConfig {
            threads: 1,
            dump_path: Some(dump_path.clone()),
            ..RunnerConfig::default()
        },
    )
    .unwrap();
    let (started_tx, started_rx) = channel::bounded::<()>(0);
    let blocker = runner
        .submit(TaskDef::new("blocker", move |ctx| {
            started_tx.send(())?;
            while !ctx.is_stopped() {
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        }))
        .unwrap();
    for i in 0..2 {
        let spec = TaskSpec {
            kind: "echo".to_string(),
            name: format!("echo-{i}"),
            dedup_key: format!("echo-{i}"),
            payload: serde_json::json!({ "text": format!("hello {i}") }),
        };
        runner
            .submit(TaskDef::new(format!("echo-{i}"), |_ctx| Ok(())).spec(spec))
            .unwrap();
    }
    started_rx.recv().unwrap();

    // the blocker is running (no spec: skipped with a warning); the two
    // spec'd tasks are still waiting and get saved
    let saved = runner.flush_to_disk(Duration::from_millis(100)).unwrap();
    assert_eq!(saved, 2);
    blocker.cancel();
    assert!(blocker.wait(Duration::from_secs(5)));
    assert!(runner.await_termination(Duration::from_secs(5)));

    let loader = TaskRunner::with_config(
        "loader",
        RunnerConfig {
            threads: 1,
            dump_path: Some(dump_path),
            ..RunnerConfig::default()
        },
    )
    .unwrap();
    let loaded = loader
        .load(|spec| {
            if spec.kind != "echo" {
                return None;
            }
            let text = spec.payload["text"].as_str().unwrap_or_default().to_string();
            Some(
                TaskDef::new(spec.name.clone(), move |_ctx| Ok(text))
                    .dedup_key(spec.dedup_key.clone())
                    .spec(spec.clone()),
            )
        })
        .unwrap();
    assert_eq!(loaded, 2);

    assert!(wait_until(Duration::from_secs(5), || loader.queue_size() == 0));
    assert_eq!(
        loader.find_task("echo-0").unwrap().status,
        TaskStatus::Done
    );
    assert_eq!(
        loader.find_task("echo-1").unwrap().status,
        TaskStatus::Done
    );
}
