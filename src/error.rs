//! Error types for retry and guard failures.

use std::time::Duration;

/// Error returned when every permitted attempt failed.
///
/// Carries the final error along with metadata about the run.
///
/// # Examples
///
/// ```rust
/// use ebbtide::{retry, RetryPolicy};
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let outcome = retry(
///     || async { Err::<i32, _>("always fails") },
///     RetryPolicy::fixed(Duration::from_millis(1), 2),
/// )
/// .await;
///
/// let exhausted = outcome.into_result().unwrap_err();
/// assert_eq!(exhausted.last_error, "always fails");
/// assert_eq!(exhausted.attempts, 2);
/// # });
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryExhausted<E> {
    /// The error from the final attempt.
    pub last_error: E,
    /// Total invocations made, including the first.
    pub attempts: u32,
    /// Wall-clock time spent on the run.
    pub elapsed: Duration,
}

impl<E> RetryExhausted<E> {
    /// Create a new RetryExhausted error.
    pub fn new(last_error: E, attempts: u32, elapsed: Duration) -> Self {
        Self {
            last_error,
            attempts,
            elapsed,
        }
    }

    /// Extract the final error, discarding metadata.
    pub fn into_error(self) -> E {
        self.last_error
    }

    /// Get a reference to the final error.
    pub fn error(&self) -> &E {
        &self.last_error
    }
}

impl<E: std::fmt::Display> std::fmt::Display for RetryExhausted<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "retry exhausted after {} attempts ({:?}): {}",
            self.attempts, self.elapsed, self.last_error
        )
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryExhausted<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.last_error)
    }
}

/// Diagnostic produced when a recognized blocking call runs inside a
/// non-blocking scope.
///
/// Created by the wrappers in [`crate::guard`] and latched on the active
/// scope, where schedulers expose it through the task handle. The retry
/// drivers treat a latched violation as terminal: the attempt that
/// tripped it is never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockingOperationDetected {
    api: &'static str,
    thread: Option<String>,
}

impl BlockingOperationDetected {
    pub(crate) fn new(api: &'static str) -> Self {
        Self {
            api,
            thread: std::thread::current().name().map(str::to_owned),
        }
    }

    /// The blocking API that was about to run.
    pub fn api(&self) -> &'static str {
        self.api
    }

    /// Name of the worker thread the call was attempted on, if it has one.
    pub fn thread(&self) -> Option<&str> {
        self.thread.as_deref()
    }
}

impl std::fmt::Display for BlockingOperationDetected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.thread {
            Some(thread) => write!(
                f,
                "blocking call to `{}` detected on non-blocking worker `{}`",
                self.api, thread
            ),
            None => write!(
                f,
                "blocking call to `{}` detected on non-blocking worker",
                self.api
            ),
        }
    }
}

impl std::error::Error for BlockingOperationDetected {}
