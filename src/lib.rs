//! # Ebbtide
//!
//! > *"The tide draws back only to return"*
//!
//! A Rust library for retrying async operations with backoff, scheduled
//! attempts, and blocking-call detection.
//!
//! ## Philosophy
//!
//! **Ebbtide** embodies the principle of **pure decisions, scheduled execution**:
//! - **Ebb** = Policies (pure backoff arithmetic, referentially transparent)
//! - **Tide** = Drivers (flowing, waiting out delays and running attempts)
//!
//! A [`RetryPolicy`] never sleeps, spawns, or touches a clock; it only
//! answers "retry after this delay, or give up". Everything that actually
//! waits lives in the drivers: [`retry`] and friends in place on the
//! calling task, [`RetryController`] as scheduled tasks on a
//! [`Scheduler`]. The split keeps the arithmetic trivially testable and
//! the execution swappable.
//!
//! ## Quick Example
//!
//! ```rust
//! use ebbtide::{retry, RetryPolicy};
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let calls = AtomicU32::new(0);
//!
//! // Fails twice, then connects.
//! let outcome = retry(
//!     || async {
//!         if calls.fetch_add(1, Ordering::SeqCst) < 2 {
//!             Err("connection refused")
//!         } else {
//!             Ok("connected")
//!         }
//!     },
//!     RetryPolicy::exponential(
//!         Duration::from_millis(10),
//!         2.0,
//!         Duration::from_secs(1),
//!         5,
//!     ),
//! )
//! .await;
//!
//! assert_eq!(outcome.value(), Some(&"connected"));
//! assert_eq!(outcome.attempts(), 3);
//! # });
//! ```
//!
//! For more examples, see the `demos/` directory.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod controller;
pub mod error;
pub mod guard;
pub mod outcome;
pub mod policy;
pub mod scheduler;
pub mod testing;

// Re-exports
pub use controller::{retry, retry_if, retry_with_hooks, RetryController, RetryState};
pub use error::{BlockingOperationDetected, RetryExhausted};
pub use guard::{BlockingScope, Guarded};
pub use outcome::RetryOutcome;
pub use policy::{Attempt, Jitter, RetryDecision, RetryPolicy};
pub use scheduler::{Scheduler, TaskFuture, TaskHandle, TokioScheduler};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::controller::{retry, retry_if, retry_with_hooks, RetryController, RetryState};
    pub use crate::error::{BlockingOperationDetected, RetryExhausted};
    pub use crate::guard::BlockingScope;
    pub use crate::outcome::RetryOutcome;
    pub use crate::policy::{Attempt, Jitter, RetryDecision, RetryPolicy};
    pub use crate::scheduler::{Scheduler, TaskHandle, TokioScheduler};
}
