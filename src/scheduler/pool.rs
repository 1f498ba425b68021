//! Tokio-backed scheduler.

use std::io;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::runtime::{Builder, Handle, Runtime};

use super::{Scheduler, TaskFuture, TaskHandle};

/// Scheduler that runs tasks on a Tokio runtime.
///
/// [`TokioScheduler::current`] borrows the runtime of the calling
/// context; [`TokioScheduler::dedicated`] owns a named worker pool whose
/// threads live until the scheduler is dropped.
///
/// Every dispatched task runs inside a guard scope, so blocking-call
/// violations surface on the returned [`TaskHandle`]. The delay wait
/// itself happens outside that scope: waiting on the timer is the
/// scheduler's job and is never flagged. Task panics are caught and
/// logged; they never take a worker down.
///
/// # Examples
///
/// ```rust
/// use ebbtide::{Scheduler, TokioScheduler};
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let scheduler = TokioScheduler::current();
/// let (tx, rx) = tokio::sync::oneshot::channel();
///
/// scheduler.schedule(
///     Box::pin(async move {
///         let _ = tx.send(42);
///     }),
///     Duration::from_millis(1),
/// );
///
/// assert_eq!(rx.await, Ok(42));
/// # });
/// ```
#[derive(Debug)]
pub struct TokioScheduler {
    handle: Handle,
    _owned: Option<OwnedRuntime>,
}

/// Shuts the runtime down in the background on drop, so dropping the
/// scheduler never blocks the dropping thread.
#[derive(Debug)]
struct OwnedRuntime(Option<Runtime>);

impl Drop for OwnedRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.0.take() {
            runtime.shutdown_background();
        }
    }
}

impl TokioScheduler {
    /// Use the runtime of the calling context.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn current() -> Self {
        Self {
            handle: Handle::current(),
            _owned: None,
        }
    }

    /// Build a dedicated worker pool with the given number of threads.
    pub fn dedicated(worker_threads: usize) -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .thread_name("ebbtide-worker")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        Ok(Self {
            handle,
            _owned: Some(OwnedRuntime(Some(runtime))),
        })
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, task: TaskFuture, delay: Duration) -> TaskHandle {
        let handle = TaskHandle::new();
        let guarded = handle.scope().wrap(task);
        let task_handle = handle.clone();
        let join = self.handle.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if !task_handle.try_start() {
                tracing::trace!("scheduled task cancelled before start");
                return;
            }
            if let Err(panic) = AssertUnwindSafe(guarded).catch_unwind().await {
                tracing::error!(panic = panic_message(panic.as_ref()), "scheduled task panicked");
            }
            task_handle.finish();
        });
        handle.register_cancel(move || join.abort());
        handle
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
