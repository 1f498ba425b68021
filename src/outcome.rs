//! Terminal outcomes of a retry run.

use std::time::Duration;

use crate::error::RetryExhausted;

/// The deterministic result of a retry run.
///
/// Either some attempt produced a value, or every permitted attempt
/// failed and the last error is reported. Both variants carry the number
/// of invocations made and the wall-clock time spent.
///
/// # Examples
///
/// ```rust
/// use ebbtide::{retry, RetryOutcome, RetryPolicy};
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let outcome: RetryOutcome<i32, &str> = retry(
///     || async { Err("connection refused") },
///     RetryPolicy::fixed(Duration::from_millis(1), 3),
/// )
/// .await;
///
/// assert!(outcome.is_exhausted());
/// assert_eq!(outcome.attempts(), 3);
///
/// let err = outcome.into_result().unwrap_err();
/// assert_eq!(err.last_error, "connection refused");
/// # });
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T, E> {
    /// An attempt returned a value.
    Succeeded {
        /// The value produced by the successful attempt.
        value: T,
        /// Total invocations made, including the successful one.
        attempts: u32,
        /// Time from the first invocation to success.
        elapsed: Duration,
    },
    /// Every permitted attempt failed.
    Exhausted {
        /// The error from the final attempt.
        last_error: E,
        /// Total invocations made.
        attempts: u32,
        /// Time from the first invocation to giving up.
        elapsed: Duration,
    },
}

impl<T, E> RetryOutcome<T, E> {
    /// Returns true if some attempt succeeded.
    pub fn is_succeeded(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    /// Returns true if every permitted attempt failed.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }

    /// Total invocations made during the run.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Succeeded { attempts, .. } | Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    /// Wall-clock time spent on the run.
    pub fn elapsed(&self) -> Duration {
        match self {
            Self::Succeeded { elapsed, .. } | Self::Exhausted { elapsed, .. } => *elapsed,
        }
    }

    /// The produced value, if any.
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Succeeded { value, .. } => Some(value),
            Self::Exhausted { .. } => None,
        }
    }

    /// The final error, if the run was exhausted.
    pub fn last_error(&self) -> Option<&E> {
        match self {
            Self::Succeeded { .. } => None,
            Self::Exhausted { last_error, .. } => Some(last_error),
        }
    }

    /// Convert into a `Result`, mapping exhaustion to [`RetryExhausted`].
    pub fn into_result(self) -> Result<T, RetryExhausted<E>> {
        match self {
            Self::Succeeded { value, .. } => Ok(value),
            Self::Exhausted {
                last_error,
                attempts,
                elapsed,
            } => Err(RetryExhausted::new(last_error, attempts, elapsed)),
        }
    }
}
