//! Blocking-call detection for non-blocking workers.
//!
//! A [`BlockingScope`] marks the synchronous extent of every poll of a
//! wrapped future as non-blocking context. Inside that context the
//! instrumented wrappers in this module ([`sleep`], [`lock`],
//! [`read_to_end`]) refuse to block: instead of parking the worker they
//! return a [`BlockingOperationDetected`] error and latch it on the scope,
//! where schedulers expose it through the task handle.
//!
//! Detection is advisory instrumentation, not a sandbox. Only calls routed
//! through these wrappers (or through [`check`]) are seen; a raw
//! `std::thread::sleep`, a busy-spin loop, or blocking inside native code
//! goes undetected. The guard makes contract violations loud in code that
//! opts in, nothing more.
//!
//! # Examples
//!
//! ```rust
//! use ebbtide::guard::{self, BlockingScope};
//! use std::time::Duration;
//!
//! let scope = BlockingScope::new();
//! let result = futures::executor::block_on(scope.wrap(async {
//!     guard::sleep(Duration::from_millis(50))
//! }));
//!
//! assert!(result.is_err());
//! assert!(scope.violation().is_some());
//! ```

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project_lite::pin_project;

use crate::error::BlockingOperationDetected;

thread_local! {
    static ACTIVE_SCOPE: RefCell<Option<Arc<ScopeState>>> = const { RefCell::new(None) };
    static ALLOW_DEPTH: Cell<usize> = const { Cell::new(0) };
}

#[derive(Debug, Default)]
struct ScopeState {
    violation: OnceLock<BlockingOperationDetected>,
}

/// Marker for a non-blocking execution scope.
///
/// Wrap a future with [`BlockingScope::wrap`] and every poll of that
/// future runs with this scope active on the polling thread. The first
/// violation tripped inside the scope is latched and stays readable
/// through [`BlockingScope::violation`] after the future completes.
///
/// Cloning shares the underlying scope; schedulers keep one clone per
/// task so the violation outlives the task itself.
#[derive(Debug, Clone, Default)]
pub struct BlockingScope {
    state: Arc<ScopeState>,
}

impl BlockingScope {
    /// Create a scope with no recorded violation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a future so each of its polls runs inside this scope.
    pub fn wrap<F>(&self, future: F) -> Guarded<F> {
        Guarded {
            future,
            state: self.state.clone(),
        }
    }

    /// The first violation latched on this scope, if any.
    pub fn violation(&self) -> Option<BlockingOperationDetected> {
        self.state.violation.get().cloned()
    }
}

pin_project! {
    /// A future whose polls run inside a [`BlockingScope`].
    ///
    /// Created by [`BlockingScope::wrap`].
    #[derive(Debug)]
    #[must_use = "futures do nothing unless you `.await` or poll them"]
    pub struct Guarded<F> {
        #[pin]
        future: F,
        state: Arc<ScopeState>,
    }
}

impl<F: Future> Future for Guarded<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let _entered = ScopeEntered::enter(this.state.clone());
        this.future.poll(cx)
    }
}

// Restores the previous scope on drop so nested scopes unwind correctly.
struct ScopeEntered {
    previous: Option<Arc<ScopeState>>,
}

impl ScopeEntered {
    fn enter(state: Arc<ScopeState>) -> Self {
        let previous = ACTIVE_SCOPE.with(|slot| slot.borrow_mut().replace(state));
        Self { previous }
    }
}

impl Drop for ScopeEntered {
    fn drop(&mut self) {
        ACTIVE_SCOPE.with(|slot| {
            *slot.borrow_mut() = self.previous.take();
        });
    }
}

/// Fail fast if a recognized blocking call is about to run.
///
/// Outside any scope, or under [`allow`], this is a no-op. Inside a scope
/// it latches the violation, emits an error-level event, and returns the
/// violation so the caller can refuse to block. The wrappers in this
/// module are thin layers over `check`; call it directly to instrument
/// blocking APIs of your own.
pub fn check(api: &'static str) -> Result<(), BlockingOperationDetected> {
    if ALLOW_DEPTH.with(Cell::get) > 0 {
        return Ok(());
    }
    let state = ACTIVE_SCOPE.with(|slot| slot.borrow().clone());
    let Some(state) = state else {
        return Ok(());
    };
    let violation = BlockingOperationDetected::new(api);
    tracing::error!(api, "blocking call detected on non-blocking worker");
    let _ = state.violation.set(violation.clone());
    Err(violation)
}

/// The violation latched on the scope active on this thread, if any.
///
/// Retry drivers consult this after each failed attempt: an attempt that
/// tripped the guard is never retried.
pub fn current_violation() -> Option<BlockingOperationDetected> {
    ACTIVE_SCOPE.with(|slot| {
        slot.borrow()
            .as_ref()
            .and_then(|state| state.violation.get().cloned())
    })
}

/// Whether a non-blocking scope is active on the current thread.
pub fn is_active() -> bool {
    ACTIVE_SCOPE.with(|slot| slot.borrow().is_some())
}

/// Run a closure with guard checks suspended on this thread.
///
/// For internals that look blocking to the wrappers but are known to be
/// short and safe. Nests; checks resume once the outermost `allow` ends.
pub fn allow<R>(f: impl FnOnce() -> R) -> R {
    struct Reset;
    impl Drop for Reset {
        fn drop(&mut self) {
            ALLOW_DEPTH.with(|depth| depth.set(depth.get() - 1));
        }
    }

    ALLOW_DEPTH.with(|depth| depth.set(depth.get() + 1));
    let _reset = Reset;
    f()
}

/// Thread-sleep wrapper: errors inside a scope instead of parking the
/// worker. Outside a scope it sleeps normally.
pub fn sleep(duration: Duration) -> Result<(), BlockingOperationDetected> {
    check("std::thread::sleep")?;
    std::thread::sleep(duration);
    Ok(())
}

/// Mutex wrapper: errors inside a scope instead of parking the worker on
/// a contended lock. A poisoned mutex still yields its guard.
pub fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, BlockingOperationDetected> {
    check("std::sync::Mutex::lock")?;
    Ok(mutex.lock().unwrap_or_else(|e| e.into_inner()))
}

/// Blocking-read wrapper: errors inside a scope instead of waiting on
/// I/O. The violation is carried as the source of the returned
/// `io::Error`.
pub fn read_to_end<R: io::Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    check("std::io::Read::read_to_end").map_err(io::Error::other)?;
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf)?;
    Ok(buf)
}
