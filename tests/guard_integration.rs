//! Integration tests for the blocking-call guard.
//!
//! The guard is advisory: it only sees calls routed through the flagged
//! wrappers in `ebbtide::guard`, and only while a wrapped future is being
//! polled. These tests pin down both sides of that line.

use ebbtide::{
    assert_exhausted, guard, retry, BlockingOperationDetected, BlockingScope, RetryPolicy,
    Scheduler, TokioScheduler,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing_test::traced_test;

#[test]
fn test_flagged_sleep_trips_inside_a_scope() {
    let scope = BlockingScope::new();

    let result = futures::executor::block_on(
        scope.wrap(async { guard::sleep(Duration::from_millis(1)) }),
    );

    let violation = result.unwrap_err();
    assert_eq!(violation.api(), "std::thread::sleep");
    assert!(violation.thread().is_some());
    assert_eq!(
        scope.violation().map(|v| v.api()),
        Some("std::thread::sleep")
    );
}

#[test]
fn test_innocent_async_work_is_not_flagged() {
    let scope = BlockingScope::new();

    futures::executor::block_on(scope.wrap(async {
        let mut table = HashMap::new();
        for key in 0..64u64 {
            table.insert(key, key.wrapping_mul(rand::random::<u64>() | 1));
        }
        assert_eq!(table.len(), 64);
    }));

    assert!(scope.violation().is_none());
}

#[test]
fn test_flagged_calls_outside_any_scope_pass() {
    assert!(!guard::is_active());
    assert!(guard::check("anything").is_ok());
    assert!(guard::sleep(Duration::from_millis(1)).is_ok());
}

#[test]
fn test_allow_suppresses_detection_within_the_closure() {
    let scope = BlockingScope::new();

    let result = futures::executor::block_on(scope.wrap(async {
        guard::allow(|| guard::sleep(Duration::from_millis(1)))
    }));

    assert!(result.is_ok());
    assert!(scope.violation().is_none());
}

#[test]
fn test_lock_is_flagged_inside_a_scope() {
    let shared = Mutex::new(5);
    let scope = BlockingScope::new();

    let flagged =
        futures::executor::block_on(scope.wrap(async { guard::lock(&shared).map(|g| *g) }));
    assert!(flagged.is_err());

    let outside = guard::lock(&shared).map(|g| *g);
    assert_eq!(outside.ok(), Some(5));
}

#[test]
fn test_read_to_end_surfaces_violations_as_io_errors() {
    let scope = BlockingScope::new();

    let err = futures::executor::block_on(
        scope.wrap(async { guard::read_to_end(&mut &b"payload"[..]).unwrap_err() }),
    );

    let violation = err
        .get_ref()
        .and_then(|source| source.downcast_ref::<BlockingOperationDetected>())
        .unwrap();
    assert_eq!(violation.api(), "std::io::Read::read_to_end");
}

#[test]
fn test_read_to_end_outside_a_scope_reads_normally() {
    let data = guard::read_to_end(&mut &b"payload"[..]).unwrap();
    assert_eq!(data, b"payload");
}

// Interaction with retry runs

#[test]
fn test_violation_fails_a_retry_run_immediately() {
    let calls = AtomicU32::new(0);
    let scope = BlockingScope::new();

    let outcome = futures::executor::block_on(scope.wrap(retry(
        || async {
            calls.fetch_add(1, Ordering::SeqCst);
            guard::sleep(Duration::from_millis(1)).map_err(|v| v.to_string())?;
            Ok::<_, String>(())
        },
        RetryPolicy::fixed(Duration::from_millis(10), 5),
    )));

    // The policy allowed five attempts, but a violation is terminal.
    assert_exhausted!(outcome);
    assert_eq!(outcome.attempts(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(scope.violation().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_scheduler_delay_is_not_a_violation() {
    let scheduler = TokioScheduler::current();
    let (tx, rx) = tokio::sync::oneshot::channel();

    let handle = scheduler.schedule(
        Box::pin(async move {
            let _ = tx.send(());
        }),
        Duration::from_millis(50),
    );

    rx.await.unwrap();
    assert!(handle.has_started());
    assert!(handle.blocking_violation().is_none());
}

#[tokio::test]
#[traced_test]
async fn test_violations_are_logged_at_error_level() {
    let scope = BlockingScope::new();

    let result = scope
        .wrap(async { guard::sleep(Duration::from_millis(1)) })
        .await;

    assert!(result.is_err());
    assert!(logs_contain("blocking call detected"));
}
