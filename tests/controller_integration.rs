//! Integration tests for scheduler-backed retry runs.
//!
//! Most scenarios drive a TestScheduler step by step, so attempt ordering,
//! cancellation windows, and recorded delays are checked without any real
//! waiting. The end-to-end scenarios run on the tokio pool under a paused
//! clock.

use ebbtide::testing::{ScriptedOperation, TestScheduler};
use ebbtide::{assert_exhausted, assert_succeeded, guard};
use ebbtide::{RetryController, RetryPolicy, RetryState, TokioScheduler};
use futures::executor::block_on;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
enum TestError {
    Transient,
    Permanent,
}

// Deterministic stepping

#[test]
fn test_controller_drives_to_success_step_by_step() {
    let scheduler = Arc::new(TestScheduler::new());
    let script = ScriptedOperation::succeed_after(2, "flaky", 7);
    let mut controller = RetryController::start(
        scheduler.clone(),
        script.operation(),
        RetryPolicy::fixed(Duration::from_millis(10), 5),
    );

    assert_eq!(controller.state(), RetryState::Running { attempt: 0 });
    assert_eq!(controller.attempts_started(), 0);

    assert!(scheduler.step());
    assert_eq!(controller.attempts_started(), 1);
    assert_eq!(controller.state(), RetryState::Running { attempt: 0 });

    assert!(scheduler.step());
    assert_eq!(controller.attempts_started(), 2);
    assert_eq!(controller.state(), RetryState::Running { attempt: 1 });

    assert!(scheduler.step());
    assert_eq!(controller.attempts_started(), 3);
    assert_eq!(controller.state(), RetryState::Succeeded);
    assert!(!scheduler.step());

    let outcome = block_on(controller.outcome()).unwrap();
    assert_succeeded!(outcome);
    assert_eq!(outcome.attempts(), 3);
    assert_eq!(outcome.value(), Some(&7));
    assert_eq!(
        scheduler.scheduled_delays(),
        vec![Duration::from_millis(10); 2]
    );
}

#[test]
fn test_exhausted_run_records_the_backoff_schedule() {
    let scheduler = Arc::new(TestScheduler::new());
    let script: ScriptedOperation<(), _> = ScriptedOperation::always_fail("boom");
    let mut controller = RetryController::start(
        scheduler.clone(),
        script.operation(),
        RetryPolicy::exponential(
            Duration::from_millis(10),
            10.0,
            Duration::from_millis(1000),
            5,
        ),
    );

    scheduler.run();

    assert_eq!(controller.state(), RetryState::Exhausted);
    assert_eq!(script.invocations(), 5);
    assert_eq!(
        scheduler.scheduled_delays(),
        vec![
            Duration::from_millis(10),
            Duration::from_millis(100),
            Duration::from_millis(1000),
            Duration::from_millis(1000),
        ]
    );
    assert_eq!(scheduler.now(), Duration::from_millis(2110));

    let outcome = block_on(controller.outcome()).unwrap();
    assert_exhausted!(outcome);
    assert_eq!(outcome.attempts(), 5);
    assert_eq!(outcome.last_error(), Some(&"boom"));
}

// Cancellation windows

#[test]
fn test_cancel_between_attempts_stops_the_run() {
    let scheduler = Arc::new(TestScheduler::new());
    let script: ScriptedOperation<(), _> = ScriptedOperation::always_fail("boom");
    let mut controller = RetryController::start(
        scheduler.clone(),
        script.operation(),
        RetryPolicy::fixed(Duration::from_millis(10), 5),
    );

    // Attempt 0 fails and schedules attempt 1.
    assert!(scheduler.step());
    assert_eq!(script.invocations(), 1);
    assert_eq!(scheduler.pending(), 1);

    controller.cancel();

    // The queued attempt is discarded without running.
    assert!(!scheduler.step());
    assert_eq!(script.invocations(), 1);
    assert_eq!(controller.state(), RetryState::Cancelled);
    assert_eq!(block_on(controller.outcome()), None);
}

#[test]
fn test_cancel_before_the_first_attempt() {
    let scheduler = Arc::new(TestScheduler::new());
    let script = ScriptedOperation::succeed_after(0, "never", 1);
    let mut controller = RetryController::start(
        scheduler.clone(),
        script.operation(),
        RetryPolicy::fixed(Duration::from_millis(10), 5),
    );

    controller.cancel();

    assert!(!scheduler.step());
    assert_eq!(script.invocations(), 0);
    assert_eq!(controller.state(), RetryState::Cancelled);
    assert_eq!(block_on(controller.outcome()), None);
}

#[test]
fn test_dropping_the_controller_does_not_cancel() {
    let scheduler = Arc::new(TestScheduler::new());
    let script = ScriptedOperation::succeed_after(2, "flaky", 1);
    let controller = RetryController::start(
        scheduler.clone(),
        script.operation(),
        RetryPolicy::fixed(Duration::from_millis(10), 5),
    );

    drop(controller);
    scheduler.run();

    assert_eq!(script.invocations(), 3);
}

// Error classification

#[test]
fn test_start_if_stops_on_permanent_error() {
    let scheduler = Arc::new(TestScheduler::new());
    let script: ScriptedOperation<(), _> = ScriptedOperation::always_fail(TestError::Permanent);
    let mut controller = RetryController::start_if(
        scheduler.clone(),
        script.operation(),
        RetryPolicy::fixed(Duration::from_millis(10), 5),
        |err| matches!(err, TestError::Transient),
    );

    scheduler.run();

    assert_eq!(controller.state(), RetryState::Exhausted);
    assert_eq!(script.invocations(), 1);
    let outcome = block_on(controller.outcome()).unwrap();
    assert_eq!(outcome.attempts(), 1);
    assert_eq!(outcome.last_error(), Some(&TestError::Permanent));
}

#[test]
fn test_start_if_retries_transient_errors() {
    let scheduler = Arc::new(TestScheduler::new());
    let script = ScriptedOperation::succeed_after(1, TestError::Transient, "ok");
    let mut controller = RetryController::start_if(
        scheduler.clone(),
        script.operation(),
        RetryPolicy::fixed(Duration::from_millis(10), 5),
        |err| matches!(err, TestError::Transient),
    );

    scheduler.run();

    assert_eq!(controller.state(), RetryState::Succeeded);
    let outcome = block_on(controller.outcome()).unwrap();
    assert_succeeded!(outcome);
    assert_eq!(outcome.attempts(), 2);
}

// Blocking-call guard

#[test]
fn test_blocking_violation_ends_the_run() {
    let scheduler = Arc::new(TestScheduler::new());
    let mut controller = RetryController::start(
        scheduler.clone(),
        || async {
            guard::sleep(Duration::from_millis(1)).map_err(|v| v.to_string())?;
            Ok::<_, String>(0u32)
        },
        RetryPolicy::fixed(Duration::from_millis(10), 5),
    );

    scheduler.run();

    // A flagged blocking call is terminal: no retries are scheduled.
    assert_eq!(controller.state(), RetryState::Exhausted);
    assert!(scheduler.scheduled_delays().is_empty());
    let outcome = block_on(controller.outcome()).unwrap();
    assert_exhausted!(outcome);
    assert_eq!(outcome.attempts(), 1);
    assert!(outcome.last_error().unwrap().contains("std::thread::sleep"));
}

// End to end on the tokio pool

#[tokio::test(start_paused = true)]
async fn test_tokio_scheduler_end_to_end_success() {
    let scheduler = Arc::new(TokioScheduler::current());
    let script = ScriptedOperation::succeed_after(2, "flaky", 5);
    let mut controller = RetryController::start(
        scheduler,
        script.operation(),
        RetryPolicy::fixed(Duration::from_millis(100), 5),
    );

    let outcome = controller.outcome().await.unwrap();

    assert_succeeded!(outcome);
    assert_eq!(outcome.attempts(), 3);
    assert_eq!(outcome.elapsed(), Duration::from_millis(200));
    assert_eq!(controller.state(), RetryState::Succeeded);
    assert_eq!(script.invocations(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_tokio_scheduler_cancel_between_attempts() {
    let scheduler = Arc::new(TokioScheduler::current());
    let script: ScriptedOperation<(), _> = ScriptedOperation::always_fail("boom");
    let mut controller = RetryController::start(
        scheduler,
        script.operation(),
        RetryPolicy::fixed(Duration::from_secs(60), 5),
    );

    while controller.attempts_started() == 0 {
        tokio::task::yield_now().await;
    }
    controller.cancel();

    // Roll time well past the backoff delay; nothing may fire.
    tokio::time::sleep(Duration::from_secs(180)).await;

    assert_eq!(script.invocations(), 1);
    assert_eq!(controller.state(), RetryState::Cancelled);
    assert_eq!(controller.outcome().await, None);
}
