//! Scheduling contract for non-blocking workers.
//!
//! A [`Scheduler`] accepts boxed tasks for immediate or delayed execution
//! and hands back a [`TaskHandle`]. Cancellation through the handle is
//! race-free: a pending task either starts or is cancelled, never both.
//!
//! [`TokioScheduler`] is the production implementation; the deterministic
//! [`crate::testing::TestScheduler`] drives the same contract on a
//! virtual clock.

mod pool;

pub use pool::TokioScheduler;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::BlockingOperationDetected;
use crate::guard::BlockingScope;

/// A boxed task accepted by a [`Scheduler`].
pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A pool of workers that run tasks without blocking the caller.
///
/// Both methods return immediately. A submitted task runs on exactly one
/// worker exactly once, asynchronously with respect to the caller, unless
/// it is cancelled first. Implementations wrap every dispatched task in a
/// [`BlockingScope`] so guard violations surface through the handle.
///
/// Schedulers are safe to share: scheduling and cancellation may happen
/// concurrently from any thread.
pub trait Scheduler: Send + Sync {
    /// Run a task once the given delay has elapsed.
    fn schedule(&self, task: TaskFuture, delay: Duration) -> TaskHandle;

    /// Run a task as soon as a worker is free.
    fn submit(&self, task: TaskFuture) -> TaskHandle {
        self.schedule(task, Duration::ZERO)
    }
}

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const FINISHED: u8 = 2;
const CANCELLED: u8 = 3;

struct TaskState {
    phase: AtomicU8,
    scope: BlockingScope,
    on_cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

/// Handle to a scheduled task.
///
/// The task moves through `Pending`, then either `Cancelled` or `Running`
/// followed by `Finished`. The transitions out of `Pending` are a single
/// atomic step, so [`TaskHandle::cancel`] and the task starting cannot
/// both win. Cloning hands out another view of the same task.
#[derive(Clone)]
pub struct TaskHandle {
    state: Arc<TaskState>,
}

impl TaskHandle {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(TaskState {
                phase: AtomicU8::new(PENDING),
                scope: BlockingScope::new(),
                on_cancel: Mutex::new(None),
            }),
        }
    }

    /// The guard scope the task runs under.
    pub(crate) fn scope(&self) -> &BlockingScope {
        &self.state.scope
    }

    /// Register teardown to run when the task is cancelled while pending.
    /// Used by schedulers to release timers promptly.
    pub(crate) fn register_cancel(&self, f: impl FnOnce() + Send + 'static) {
        let mut slot = self
            .state
            .on_cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if self.is_cancelled() {
            // Cancellation raced registration; tear down now.
            drop(slot);
            f();
            return;
        }
        *slot = Some(Box::new(f));
    }

    /// Claim the right to run the task. Fails iff it was cancelled first.
    pub(crate) fn try_start(&self) -> bool {
        self.state
            .phase
            .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Mark the task complete.
    pub(crate) fn finish(&self) {
        let _ = self.state.phase.compare_exchange(
            RUNNING,
            FINISHED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Cancel the task if it has not started.
    ///
    /// Idempotent and non-blocking. A pending task is guaranteed never to
    /// start and its timer is released promptly; a task that already
    /// started is not affected and runs to completion.
    pub fn cancel(&self) {
        if self
            .state
            .phase
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let teardown = {
                let mut slot = self
                    .state
                    .on_cancel
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                slot.take()
            };
            if let Some(f) = teardown {
                f();
            }
        }
    }

    /// Whether the task is still waiting to run.
    pub fn is_pending(&self) -> bool {
        self.state.phase.load(Ordering::Acquire) == PENDING
    }

    /// Whether the task was cancelled before it started.
    pub fn is_cancelled(&self) -> bool {
        self.state.phase.load(Ordering::Acquire) == CANCELLED
    }

    /// Whether the task has started running. Remains true once finished.
    pub fn has_started(&self) -> bool {
        matches!(
            self.state.phase.load(Ordering::Acquire),
            RUNNING | FINISHED
        )
    }

    /// Whether the task ran to completion.
    pub fn is_finished(&self) -> bool {
        self.state.phase.load(Ordering::Acquire) == FINISHED
    }

    /// The first blocking-call violation the task tripped, if any.
    pub fn blocking_violation(&self) -> Option<BlockingOperationDetected> {
        self.state.scope.violation()
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self.state.phase.load(Ordering::Acquire) {
            PENDING => "pending",
            RUNNING => "running",
            FINISHED => "finished",
            CANCELLED => "cancelled",
            _ => "unknown",
        };
        f.debug_struct("TaskHandle").field("phase", &phase).finish()
    }
}
