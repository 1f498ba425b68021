//! Test doubles for retry runs.
//!
//! [`ScriptedOperation`] fabricates an async operation that fails a
//! scripted number of times before succeeding, counting invocations as
//! it goes. [`TestScheduler`] is a [`Scheduler`] that executes tasks
//! deterministically on the calling thread under a virtual clock and
//! records every backoff delay it is asked to wait, so tests assert on
//! timing without sleeping.
//!
//! # Examples
//!
//! ```rust
//! use ebbtide::testing::{ScriptedOperation, TestScheduler};
//! use ebbtide::{RetryController, RetryPolicy};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let scheduler = Arc::new(TestScheduler::new());
//! let script = ScriptedOperation::succeed_after(2, "flaky", "done");
//! let controller = RetryController::start(
//!     scheduler.clone(),
//!     script.operation(),
//!     RetryPolicy::fixed(Duration::from_millis(25), 5),
//! );
//!
//! scheduler.run();
//!
//! assert_eq!(script.invocations(), 3);
//! assert_eq!(
//!     scheduler.scheduled_delays(),
//!     vec![Duration::from_millis(25); 2]
//! );
//! # drop(controller);
//! ```

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{self, Ready};

use crate::scheduler::{Scheduler, TaskFuture, TaskHandle};

/// An async operation with a scripted failure pattern.
///
/// Clones share the invocation counter, so a test can hand the operation
/// to a driver and keep a handle for assertions.
#[derive(Debug, Clone)]
pub struct ScriptedOperation<T, E> {
    inner: Arc<Inner<T, E>>,
}

#[derive(Debug)]
struct Inner<T, E> {
    /// Invocations that fail before the first success; `None` never
    /// succeeds.
    failures: Option<u32>,
    value: Option<T>,
    error: E,
    invocations: AtomicU32,
}

impl<T, E> ScriptedOperation<T, E> {
    /// An operation that fails `failures` times with clones of `error`,
    /// then succeeds with clones of `value` forever after.
    pub fn succeed_after(failures: u32, error: E, value: T) -> Self {
        Self {
            inner: Arc::new(Inner {
                failures: Some(failures),
                value: Some(value),
                error,
                invocations: AtomicU32::new(0),
            }),
        }
    }

    /// An operation that fails every invocation with clones of `error`.
    pub fn always_fail(error: E) -> Self {
        Self {
            inner: Arc::new(Inner {
                failures: None,
                value: None,
                error,
                invocations: AtomicU32::new(0),
            }),
        }
    }

    /// How many times the operation has been invoked.
    pub fn invocations(&self) -> u32 {
        self.inner.invocations.load(Ordering::SeqCst)
    }

    /// The operation itself: a factory yielding one ready future per
    /// invocation.
    pub fn operation(&self) -> impl Fn() -> Ready<Result<T, E>>
    where
        T: Clone,
        E: Clone,
    {
        let inner = Arc::clone(&self.inner);
        move || {
            let invocation = inner.invocations.fetch_add(1, Ordering::SeqCst);
            let result = match (inner.failures, &inner.value) {
                (Some(failures), Some(value)) if invocation >= failures => Ok(value.clone()),
                _ => Err(inner.error.clone()),
            };
            future::ready(result)
        }
    }
}

struct QueueEntry {
    fire_at: Duration,
    seq: u64,
    task: TaskFuture,
    handle: TaskHandle,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.fire_at, self.seq).cmp(&(other.fire_at, other.seq))
    }
}

struct SchedulerState {
    now: Duration,
    seq: u64,
    queue: BinaryHeap<Reverse<QueueEntry>>,
    delays: Vec<Duration>,
}

/// A deterministic, single-threaded [`Scheduler`] for tests.
///
/// Tasks run only when the test calls [`TestScheduler::step`] or
/// [`TestScheduler::run`], in fire-time order with ties broken by
/// submission order. Time is virtual: the clock jumps straight to each
/// task's fire time, so a minute of backoff costs nothing.
pub struct TestScheduler {
    state: Mutex<SchedulerState>,
}

impl TestScheduler {
    /// A scheduler with an empty queue and the clock at zero.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SchedulerState {
                now: Duration::ZERO,
                seq: 0,
                queue: BinaryHeap::new(),
                delays: Vec::new(),
            }),
        }
    }

    /// Run the next due task to completion on the calling thread.
    ///
    /// Cancelled entries are discarded without running. Returns false
    /// once the queue holds nothing runnable.
    pub fn step(&self) -> bool {
        loop {
            // The lock must not be held while the task runs: tasks
            // reschedule through this same scheduler.
            let entry = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                match state.queue.pop() {
                    Some(Reverse(entry)) => {
                        state.now = state.now.max(entry.fire_at);
                        entry
                    }
                    None => return false,
                }
            };
            if !entry.handle.try_start() {
                continue;
            }
            futures::executor::block_on(entry.handle.scope().wrap(entry.task));
            entry.handle.finish();
            return true;
        }
    }

    /// Step until the queue is empty.
    pub fn run(&self) {
        while self.step() {}
    }

    /// Every delay passed to [`Scheduler::schedule`], in order.
    /// Zero-delay [`Scheduler::submit`] calls are not recorded.
    pub fn scheduled_delays(&self) -> Vec<Duration> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .delays
            .clone()
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).now
    }

    /// Entries still queued, including cancelled ones not yet discarded.
    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .queue
            .len()
    }

    fn push(&self, task: TaskFuture, delay: Duration, record: bool) -> TaskHandle {
        let handle = TaskHandle::new();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if record {
            state.delays.push(delay);
        }
        let entry = QueueEntry {
            fire_at: state.now.saturating_add(delay),
            seq: state.seq,
            task,
            handle: handle.clone(),
        };
        state.seq += 1;
        state.queue.push(Reverse(entry));
        handle
    }
}

impl Default for TestScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for TestScheduler {
    fn schedule(&self, task: TaskFuture, delay: Duration) -> TaskHandle {
        self.push(task, delay, true)
    }

    fn submit(&self, task: TaskFuture) -> TaskHandle {
        self.push(task, Duration::ZERO, false)
    }
}

impl fmt::Debug for TestScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("TestScheduler")
            .field("now", &state.now)
            .field("pending", &state.queue.len())
            .field("scheduled_delays", &state.delays)
            .finish()
    }
}

/// Assert that a retry outcome is `Succeeded`.
///
/// This macro will panic if the outcome is `Exhausted`.
///
/// # Examples
///
/// ```rust
/// use ebbtide::{RetryOutcome, assert_succeeded};
/// use std::time::Duration;
///
/// let outcome: RetryOutcome<i32, &str> = RetryOutcome::Succeeded {
///     value: 1,
///     attempts: 1,
///     elapsed: Duration::ZERO,
/// };
/// assert_succeeded!(outcome);
/// ```
#[macro_export]
macro_rules! assert_succeeded {
    ($outcome:expr) => {
        match &$outcome {
            $crate::RetryOutcome::Succeeded { .. } => {}
            $crate::RetryOutcome::Exhausted {
                last_error,
                attempts,
                ..
            } => {
                panic!(
                    "Expected Succeeded, got Exhausted after {} attempts: {:?}",
                    attempts, last_error
                );
            }
        }
    };
}

/// Assert that a retry outcome is `Exhausted`.
///
/// This macro will panic if the outcome is `Succeeded`.
///
/// # Examples
///
/// ```rust
/// use ebbtide::{RetryOutcome, assert_exhausted};
/// use std::time::Duration;
///
/// let outcome: RetryOutcome<i32, &str> = RetryOutcome::Exhausted {
///     last_error: "boom",
///     attempts: 3,
///     elapsed: Duration::ZERO,
/// };
/// assert_exhausted!(outcome);
/// ```
#[macro_export]
macro_rules! assert_exhausted {
    ($outcome:expr) => {
        match &$outcome {
            $crate::RetryOutcome::Exhausted { .. } => {}
            $crate::RetryOutcome::Succeeded { value, attempts, .. } => {
                panic!(
                    "Expected Exhausted, got Succeeded after {} attempts: {:?}",
                    attempts, value
                );
            }
        }
    };
}

#[cfg(test)]
mod testing_tests {
    use super::*;
    use crate::guard;
    use crate::RetryOutcome;

    fn counting_task(counter: Arc<AtomicU32>) -> TaskFuture {
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_scripted_operation_follows_the_script() {
        let script = ScriptedOperation::succeed_after(2, "nope", 5);
        let operation = script.operation();

        assert_eq!(futures::executor::block_on(operation()), Err("nope"));
        assert_eq!(futures::executor::block_on(operation()), Err("nope"));
        assert_eq!(futures::executor::block_on(operation()), Ok(5));
        assert_eq!(script.invocations(), 3);
    }

    #[test]
    fn test_always_fail_never_succeeds() {
        let script: ScriptedOperation<i32, _> = ScriptedOperation::always_fail("nope");
        let operation = script.operation();

        for _ in 0..10 {
            assert_eq!(futures::executor::block_on(operation()), Err("nope"));
        }
        assert_eq!(script.invocations(), 10);
    }

    #[test]
    fn test_clones_share_the_invocation_counter() {
        let script = ScriptedOperation::succeed_after(0, "nope", 1);
        let clone = script.clone();

        futures::executor::block_on(script.operation()());
        assert_eq!(clone.invocations(), 1);
    }

    #[test]
    fn test_tasks_run_in_fire_time_order() {
        let scheduler = TestScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (label, delay) in [("slow", 30u64), ("fast", 10), ("medium", 20)] {
            let order = Arc::clone(&order);
            scheduler.schedule(
                Box::pin(async move {
                    order.lock().unwrap().push(label);
                }),
                Duration::from_millis(delay),
            );
        }
        scheduler.run();

        assert_eq!(*order.lock().unwrap(), vec!["fast", "medium", "slow"]);
    }

    #[test]
    fn test_ties_break_by_submission_order() {
        let scheduler = TestScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            scheduler.schedule(
                Box::pin(async move {
                    order.lock().unwrap().push(label);
                }),
                Duration::from_millis(5),
            );
        }
        scheduler.run();

        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_delays_are_recorded_but_submissions_are_not() {
        let scheduler = TestScheduler::new();
        let counter = Arc::new(AtomicU32::new(0));

        scheduler.submit(counting_task(Arc::clone(&counter)));
        scheduler.schedule(
            counting_task(Arc::clone(&counter)),
            Duration::from_millis(40),
        );
        scheduler.run();

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.scheduled_delays(), vec![Duration::from_millis(40)]);
    }

    #[test]
    fn test_clock_jumps_to_each_fire_time() {
        let scheduler = TestScheduler::new();
        let counter = Arc::new(AtomicU32::new(0));

        scheduler.schedule(counting_task(Arc::clone(&counter)), Duration::from_secs(60));
        assert_eq!(scheduler.now(), Duration::ZERO);

        scheduler.run();
        assert_eq!(scheduler.now(), Duration::from_secs(60));
    }

    #[test]
    fn test_huge_delays_saturate_the_clock() {
        let scheduler = TestScheduler::new();
        let counter = Arc::new(AtomicU32::new(0));

        scheduler.schedule(counting_task(Arc::clone(&counter)), Duration::from_secs(1));
        assert!(scheduler.step());

        // The clock is past zero, so an unbounded delay must saturate.
        scheduler.schedule(counting_task(Arc::clone(&counter)), Duration::MAX);
        assert!(scheduler.step());

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.now(), Duration::MAX);
    }

    #[test]
    fn test_cancelled_entry_is_discarded_without_running() {
        let scheduler = TestScheduler::new();
        let counter = Arc::new(AtomicU32::new(0));

        let handle = scheduler.schedule(
            counting_task(Arc::clone(&counter)),
            Duration::from_millis(10),
        );
        handle.cancel();

        assert!(!scheduler.step());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_step_on_empty_queue_returns_false() {
        let scheduler = TestScheduler::new();
        assert!(!scheduler.step());
    }

    #[test]
    fn test_tasks_run_under_a_blocking_scope() {
        let scheduler = TestScheduler::new();
        let observed = Arc::new(Mutex::new(false));

        let observed_in_task = Arc::clone(&observed);
        scheduler.submit(Box::pin(async move {
            *observed_in_task.lock().unwrap() = guard::is_active();
        }));
        scheduler.run();

        assert!(*observed.lock().unwrap());
    }

    #[test]
    fn test_assert_succeeded_macro() {
        let outcome: RetryOutcome<i32, &str> = RetryOutcome::Succeeded {
            value: 1,
            attempts: 1,
            elapsed: Duration::ZERO,
        };
        assert_succeeded!(outcome);
    }

    #[test]
    #[should_panic(expected = "Expected Succeeded, got Exhausted")]
    fn test_assert_succeeded_panics_on_exhaustion() {
        let outcome: RetryOutcome<i32, &str> = RetryOutcome::Exhausted {
            last_error: "boom",
            attempts: 2,
            elapsed: Duration::ZERO,
        };
        assert_succeeded!(outcome);
    }

    #[test]
    fn test_assert_exhausted_macro() {
        let outcome: RetryOutcome<i32, &str> = RetryOutcome::Exhausted {
            last_error: "boom",
            attempts: 2,
            elapsed: Duration::ZERO,
        };
        assert_exhausted!(outcome);
    }

    #[test]
    #[should_panic(expected = "Expected Exhausted, got Succeeded")]
    fn test_assert_exhausted_panics_on_success() {
        let outcome: RetryOutcome<i32, &str> = RetryOutcome::Succeeded {
            value: 1,
            attempts: 1,
            elapsed: Duration::ZERO,
        };
        assert_exhausted!(outcome);
    }
}
