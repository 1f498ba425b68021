//! Retry drivers.
//!
//! Two surfaces over the same policy core. The free functions ([`retry`],
//! [`retry_if`], [`retry_with_hooks`]) drive attempts in place on the
//! calling task, sleeping out delays with the ambient timer. A
//! [`RetryController`] instead runs every attempt as its own task on an
//! injected [`Scheduler`], which adds cancellation between attempts and
//! observable state.
//!
//! Either way the loop is the same: invoke the operation, and on failure
//! ask the [`RetryPolicy`] whether to wait and go again. Attempts are
//! strictly sequential; there is never more than one invocation in
//! flight per run.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::guard;
use crate::outcome::RetryOutcome;
use crate::policy::{Attempt, RetryDecision, RetryPolicy};
use crate::scheduler::{Scheduler, TaskHandle};

/// Retry an operation according to a policy, driving attempts in place.
///
/// The operation is a factory: each attempt invokes it for a fresh
/// future, so connections, request ids and the like are rebuilt from
/// scratch. The call resolves once an attempt succeeds or the policy
/// gives up; it never blocks a thread, the only waits are the operation
/// itself and the backoff timer.
///
/// # Examples
///
/// ```rust
/// use ebbtide::{retry, RetryOutcome, RetryPolicy};
/// use std::sync::atomic::{AtomicU32, Ordering};
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let calls = AtomicU32::new(0);
/// let outcome = retry(
///     || async {
///         if calls.fetch_add(1, Ordering::SeqCst) < 2 {
///             Err("connection refused")
///         } else {
///             Ok(42)
///         }
///     },
///     RetryPolicy::fixed(Duration::from_millis(1), 5),
/// )
/// .await;
///
/// assert!(matches!(
///     outcome,
///     RetryOutcome::Succeeded { value: 42, attempts: 3, .. }
/// ));
/// # });
/// ```
pub async fn retry<T, E, Op, Fut>(operation: Op, policy: RetryPolicy) -> RetryOutcome<T, E>
where
    Op: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    debug_assert!(policy.validate().is_ok(), "invalid retry policy");
    let start = Instant::now();
    let mut rng = StdRng::from_os_rng();
    let mut index = 0u32;

    loop {
        match operation().await {
            Ok(value) => {
                return RetryOutcome::Succeeded {
                    value,
                    attempts: index + 1,
                    elapsed: start.elapsed(),
                }
            }
            Err(error) => {
                if let Some(violation) = guard::current_violation() {
                    error!(%violation, attempt = index, "attempt tripped the blocking-call guard");
                    return RetryOutcome::Exhausted {
                        last_error: error,
                        attempts: index + 1,
                        elapsed: start.elapsed(),
                    };
                }
                let attempt = Attempt {
                    index,
                    error: &error,
                    elapsed: start.elapsed(),
                };
                match policy.decide(&attempt, &mut rng) {
                    RetryDecision::Retry(delay) => {
                        debug!(attempt = index, ?delay, "retrying after failed attempt");
                        tokio::time::sleep(delay).await;
                        index += 1;
                    }
                    RetryDecision::GiveUp => {
                        return RetryOutcome::Exhausted {
                            last_error: error,
                            attempts: index + 1,
                            elapsed: start.elapsed(),
                        }
                    }
                }
            }
        }
    }
}

/// Retry only while the classifier returns true for the error.
///
/// A non-retryable error ends the run immediately: the outcome is
/// `Exhausted` with the attempts made so far and that error as the last
/// error. Useful for separating transient failures from permanent ones.
///
/// # Examples
///
/// ```rust
/// use ebbtide::{retry_if, RetryPolicy};
/// use std::time::Duration;
///
/// #[derive(Debug, PartialEq)]
/// enum AppError {
///     Transient,
///     Permanent,
/// }
///
/// # tokio_test::block_on(async {
/// let outcome = retry_if(
///     || async { Err::<(), _>(AppError::Permanent) },
///     RetryPolicy::fixed(Duration::from_millis(1), 5),
///     |err| matches!(err, AppError::Transient),
/// )
/// .await;
///
/// // Permanent errors are not retried.
/// assert_eq!(outcome.attempts(), 1);
/// assert_eq!(outcome.last_error(), Some(&AppError::Permanent));
/// # });
/// ```
pub async fn retry_if<T, E, Op, Fut, P>(
    operation: Op,
    policy: RetryPolicy,
    should_retry: P,
) -> RetryOutcome<T, E>
where
    Op: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    debug_assert!(policy.validate().is_ok(), "invalid retry policy");
    let start = Instant::now();
    let mut rng = StdRng::from_os_rng();
    let mut index = 0u32;

    loop {
        match operation().await {
            Ok(value) => {
                return RetryOutcome::Succeeded {
                    value,
                    attempts: index + 1,
                    elapsed: start.elapsed(),
                }
            }
            Err(error) => {
                if let Some(violation) = guard::current_violation() {
                    error!(%violation, attempt = index, "attempt tripped the blocking-call guard");
                    return RetryOutcome::Exhausted {
                        last_error: error,
                        attempts: index + 1,
                        elapsed: start.elapsed(),
                    };
                }
                if !should_retry(&error) {
                    trace!(attempt = index, "error classified non-retryable");
                    return RetryOutcome::Exhausted {
                        last_error: error,
                        attempts: index + 1,
                        elapsed: start.elapsed(),
                    };
                }
                let attempt = Attempt {
                    index,
                    error: &error,
                    elapsed: start.elapsed(),
                };
                match policy.decide(&attempt, &mut rng) {
                    RetryDecision::Retry(delay) => {
                        debug!(attempt = index, ?delay, "retrying after failed attempt");
                        tokio::time::sleep(delay).await;
                        index += 1;
                    }
                    RetryDecision::GiveUp => {
                        return RetryOutcome::Exhausted {
                            last_error: error,
                            attempts: index + 1,
                            elapsed: start.elapsed(),
                        }
                    }
                }
            }
        }
    }
}

/// Retry with a hook observing every failed attempt.
///
/// The hook receives the [`Attempt`] and the [`RetryDecision`] the policy
/// made for it, including the final `GiveUp`. It is synchronous and
/// should not block; use it for logging and metrics. The hook does not
/// run for an attempt that tripped the blocking-call guard, since that
/// attempt bypasses the policy entirely.
///
/// # Examples
///
/// ```rust
/// use ebbtide::{retry_with_hooks, RetryPolicy};
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let outcome = retry_with_hooks(
///     || async { Err::<(), _>("flaky") },
///     RetryPolicy::fixed(Duration::from_millis(1), 3),
///     |attempt, decision| {
///         println!("attempt {} failed, next: {:?}", attempt.index, decision);
///     },
/// )
/// .await;
///
/// assert_eq!(outcome.attempts(), 3);
/// # });
/// ```
pub async fn retry_with_hooks<T, E, Op, Fut, H>(
    operation: Op,
    policy: RetryPolicy,
    on_retry: H,
) -> RetryOutcome<T, E>
where
    Op: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    H: Fn(&Attempt<'_, E>, &RetryDecision),
{
    debug_assert!(policy.validate().is_ok(), "invalid retry policy");
    let start = Instant::now();
    let mut rng = StdRng::from_os_rng();
    let mut index = 0u32;

    loop {
        match operation().await {
            Ok(value) => {
                return RetryOutcome::Succeeded {
                    value,
                    attempts: index + 1,
                    elapsed: start.elapsed(),
                }
            }
            Err(error) => {
                if let Some(violation) = guard::current_violation() {
                    error!(%violation, attempt = index, "attempt tripped the blocking-call guard");
                    return RetryOutcome::Exhausted {
                        last_error: error,
                        attempts: index + 1,
                        elapsed: start.elapsed(),
                    };
                }
                let decision = {
                    let attempt = Attempt {
                        index,
                        error: &error,
                        elapsed: start.elapsed(),
                    };
                    let decision = policy.decide(&attempt, &mut rng);
                    on_retry(&attempt, &decision);
                    decision
                };
                match decision {
                    RetryDecision::Retry(delay) => {
                        debug!(attempt = index, ?delay, "retrying after failed attempt");
                        tokio::time::sleep(delay).await;
                        index += 1;
                    }
                    RetryDecision::GiveUp => {
                        return RetryOutcome::Exhausted {
                            last_error: error,
                            attempts: index + 1,
                            elapsed: start.elapsed(),
                        }
                    }
                }
            }
        }
    }
}

/// Observable state of a [`RetryController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// No attempt has been submitted yet.
    Idle,
    /// The run is live: an attempt is in flight or waiting out its delay.
    Running {
        /// Index of the newest attempt that has begun, 0 before the
        /// first invocation starts.
        attempt: u32,
    },
    /// An attempt produced a value.
    Succeeded,
    /// Every permitted attempt failed.
    Exhausted,
    /// The run was cancelled before reaching an outcome.
    Cancelled,
}

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const SUCCEEDED: u8 = 2;
const EXHAUSTED: u8 = 3;
const CANCELLED: u8 = 4;

type BoxedOp<T, E> =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<T, E>> + Send>> + Send + Sync>;
type Classifier<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

struct Driver<T, E> {
    scheduler: Arc<dyn Scheduler>,
    operation: BoxedOp<T, E>,
    policy: RetryPolicy,
    classify: Option<Classifier<E>>,
    token: CancellationToken,
    phase: AtomicU8,
    started: AtomicU32,
    // Newest scheduled attempt, keyed by attempt index so a late store
    // for an older attempt cannot clobber a newer one.
    pending: Mutex<Option<(u32, TaskHandle)>>,
    outcome_tx: Mutex<Option<oneshot::Sender<RetryOutcome<T, E>>>>,
    started_at: Instant,
    rng: Mutex<StdRng>,
}

impl<T, E> Driver<T, E> {
    /// Publish a terminal outcome. The phase transition is the
    /// linearization point against [`Driver::cancel`]; the loser's
    /// outcome is discarded.
    fn deliver(&self, outcome: RetryOutcome<T, E>) {
        let terminal = match &outcome {
            RetryOutcome::Succeeded { .. } => SUCCEEDED,
            RetryOutcome::Exhausted { .. } => EXHAUSTED,
        };
        if self
            .phase
            .compare_exchange(RUNNING, terminal, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!("outcome discarded after cancellation");
            return;
        }
        let tx = {
            let mut slot = self.outcome_tx.lock().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        if let Some(tx) = tx {
            // The receiver may be gone; that only means nobody is waiting.
            let _ = tx.send(outcome);
        }
    }

    fn cancel(&self) {
        self.token.cancel();
        self.cancel_pending();
        if self
            .phase
            .compare_exchange(RUNNING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let tx = {
                let mut slot = self.outcome_tx.lock().unwrap_or_else(|e| e.into_inner());
                slot.take()
            };
            drop(tx);
            debug!("retry run cancelled");
        }
    }

    fn cancel_pending(&self) {
        let pending = {
            let mut slot = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        if let Some((_, handle)) = pending {
            handle.cancel();
        }
    }

    fn store_pending(&self, index: u32, handle: TaskHandle) {
        let mut slot = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        match &*slot {
            Some((stored, _)) if *stored > index => {}
            _ => *slot = Some((index, handle)),
        }
    }
}

/// A retry run whose attempts are tasks on an injected [`Scheduler`].
///
/// [`RetryController::start`] submits attempt 0 immediately and returns;
/// the run then advances on the scheduler's workers. Each retry is a
/// fresh scheduled task and the controller keeps exactly one pending
/// task handle, replaced on every reschedule.
///
/// [`RetryController::cancel`] is idempotent and non-blocking: it cancels
/// the pending task, suppresses any in-flight result, and settles the
/// state at `Cancelled`. Cancellation never interrupts an invocation
/// that already started, it only stops its result from scheduling more
/// work. Dropping the controller does not cancel the run.
///
/// # Examples
///
/// ```rust
/// use ebbtide::testing::{ScriptedOperation, TestScheduler};
/// use ebbtide::{RetryController, RetryPolicy, RetryState};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let scheduler = Arc::new(TestScheduler::new());
/// let script = ScriptedOperation::succeed_after(1, "flaky", 7);
/// let mut controller = RetryController::start(
///     scheduler.clone(),
///     script.operation(),
///     RetryPolicy::fixed(Duration::from_millis(10), 3),
/// );
///
/// scheduler.run();
///
/// assert_eq!(controller.state(), RetryState::Succeeded);
/// assert_eq!(controller.attempts_started(), 2);
/// let outcome = futures::executor::block_on(controller.outcome());
/// assert_eq!(outcome.and_then(|o| o.into_result().ok()), Some(7));
/// ```
pub struct RetryController<T, E> {
    driver: Arc<Driver<T, E>>,
    outcome_rx: Option<oneshot::Receiver<RetryOutcome<T, E>>>,
}

impl<T, E> RetryController<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Start a retry run on the given scheduler.
    pub fn start<S, Op, Fut>(scheduler: Arc<S>, operation: Op, policy: RetryPolicy) -> Self
    where
        S: Scheduler + 'static,
        Op: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self::new(scheduler, operation, policy, None)
    }

    /// Start a retry run that only retries errors the classifier accepts.
    ///
    /// A non-retryable error ends the run as `Exhausted`, exactly like
    /// [`retry_if`].
    pub fn start_if<S, Op, Fut, P>(
        scheduler: Arc<S>,
        operation: Op,
        policy: RetryPolicy,
        should_retry: P,
    ) -> Self
    where
        S: Scheduler + 'static,
        Op: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        Self::new(scheduler, operation, policy, Some(Arc::new(should_retry)))
    }

    fn new<S, Op, Fut>(
        scheduler: Arc<S>,
        operation: Op,
        policy: RetryPolicy,
        classify: Option<Classifier<E>>,
    ) -> Self
    where
        S: Scheduler + 'static,
        Op: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        debug_assert!(policy.validate().is_ok(), "invalid retry policy");
        let (tx, rx) = oneshot::channel();
        let operation: BoxedOp<T, E> = Arc::new(move || {
            let fut: Pin<Box<dyn Future<Output = Result<T, E>> + Send>> =
                Box::pin(operation());
            fut
        });
        let driver = Arc::new(Driver {
            scheduler,
            operation,
            policy,
            classify,
            token: CancellationToken::new(),
            phase: AtomicU8::new(IDLE),
            started: AtomicU32::new(0),
            pending: Mutex::new(None),
            outcome_tx: Mutex::new(Some(tx)),
            started_at: Instant::now(),
            rng: Mutex::new(StdRng::from_os_rng()),
        });

        driver.phase.store(RUNNING, Ordering::Release);
        let first = driver.scheduler.submit(attempt_task(driver.clone(), 0));
        driver.store_pending(0, first);

        Self {
            driver,
            outcome_rx: Some(rx),
        }
    }

    /// Cancel the run.
    ///
    /// Idempotent and non-blocking. After cancellation no further attempt
    /// starts and [`RetryController::outcome`] resolves to `None`. Has no
    /// effect once the run reached a terminal outcome.
    pub fn cancel(&self) {
        self.driver.cancel();
    }

    /// Number of operation invocations that have begun.
    pub fn attempts_started(&self) -> u32 {
        self.driver.started.load(Ordering::Acquire)
    }

    /// Snapshot of the run's state.
    pub fn state(&self) -> RetryState {
        match self.driver.phase.load(Ordering::Acquire) {
            IDLE => RetryState::Idle,
            RUNNING => RetryState::Running {
                attempt: self.driver.started.load(Ordering::Acquire).saturating_sub(1),
            },
            SUCCEEDED => RetryState::Succeeded,
            EXHAUSTED => RetryState::Exhausted,
            _ => RetryState::Cancelled,
        }
    }

    /// Wait for the terminal outcome.
    ///
    /// Resolves to `None` if the run was cancelled before an outcome was
    /// reached. The outcome is delivered at most once; later calls
    /// return `None`.
    pub async fn outcome(&mut self) -> Option<RetryOutcome<T, E>> {
        let rx = self.outcome_rx.take()?;
        rx.await.ok()
    }
}

impl<T, E> fmt::Debug for RetryController<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryController")
            .field("state", &self.state())
            .field("attempts_started", &self.attempts_started())
            .finish()
    }
}

/// Build the task for attempt `index`. Each attempt is a fresh task;
/// retries reschedule through the scheduler rather than looping in
/// place, so no worker is held across a delay.
fn attempt_task<T, E>(driver: Arc<Driver<T, E>>, index: u32) -> crate::scheduler::TaskFuture
where
    T: Send + 'static,
    E: Send + 'static,
{
    Box::pin(async move {
        if driver.token.is_cancelled() {
            trace!(attempt = index, "attempt skipped after cancellation");
            return;
        }
        driver.started.fetch_add(1, Ordering::AcqRel);
        let result = (driver.operation)().await;
        if driver.token.is_cancelled() {
            trace!(attempt = index, "attempt result discarded after cancellation");
            return;
        }
        match result {
            Ok(value) => {
                driver.deliver(RetryOutcome::Succeeded {
                    value,
                    attempts: index + 1,
                    elapsed: driver.started_at.elapsed(),
                });
            }
            Err(error) => handle_failure(&driver, index, error),
        }
    })
}

fn handle_failure<T, E>(driver: &Arc<Driver<T, E>>, index: u32, error: E)
where
    T: Send + 'static,
    E: Send + 'static,
{
    let elapsed = driver.started_at.elapsed();
    if let Some(violation) = guard::current_violation() {
        error!(%violation, attempt = index, "attempt tripped the blocking-call guard");
        driver.deliver(RetryOutcome::Exhausted {
            last_error: error,
            attempts: index + 1,
            elapsed,
        });
        return;
    }
    if let Some(classify) = &driver.classify {
        if !classify(&error) {
            trace!(attempt = index, "error classified non-retryable");
            driver.deliver(RetryOutcome::Exhausted {
                last_error: error,
                attempts: index + 1,
                elapsed,
            });
            return;
        }
    }
    let decision = {
        let attempt = Attempt {
            index,
            error: &error,
            elapsed,
        };
        let mut rng = driver.rng.lock().unwrap_or_else(|e| e.into_inner());
        driver.policy.decide(&attempt, &mut rng)
    };
    match decision {
        RetryDecision::Retry(delay) => {
            debug!(attempt = index, ?delay, "scheduling next attempt");
            let next = driver
                .scheduler
                .schedule(attempt_task(driver.clone(), index + 1), delay);
            driver.store_pending(index + 1, next);
            // Cancellation may have landed between the token check above
            // and the store; sweep the slot so nothing fires afterwards.
            if driver.token.is_cancelled() {
                driver.cancel_pending();
            }
        }
        RetryDecision::GiveUp => {
            driver.deliver(RetryOutcome::Exhausted {
                last_error: error,
                attempts: index + 1,
                elapsed,
            });
        }
    }
}
