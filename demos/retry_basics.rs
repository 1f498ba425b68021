//! Retry Basics Example
//!
//! Demonstrates the in-place retry drivers. Shows practical patterns
//! including:
//! - Basic retry with exponential backoff
//! - Inspecting backoff schedules and jitter
//! - Conditional retry (retry_if)
//! - Retry with observability hooks
//! - Bounding a whole run with a deadline

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ebbtide::{retry, retry_if, retry_with_hooks, Jitter, RetryOutcome, RetryPolicy};
use rand::rngs::StdRng;
use rand::SeedableRng;

// ==================== Basic Retry ====================

/// Example 1: Basic retry with exponential backoff
///
/// Demonstrates retrying an operation that fails transiently.
async fn example_basic_retry() {
    println!("\n=== Example 1: Basic Retry ===");

    let attempts = Arc::new(AtomicU32::new(0));

    let outcome = retry(
        {
            let attempts = attempts.clone();
            move || {
                let attempts = attempts.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    println!("  Attempt {}", n + 1);
                    if n < 2 {
                        Err("transient failure")
                    } else {
                        Ok("success!")
                    }
                }
            }
        },
        RetryPolicy::exponential(Duration::from_millis(50), 2.0, Duration::from_secs(1), 5),
    )
    .await;

    match outcome {
        RetryOutcome::Succeeded {
            value,
            attempts,
            elapsed,
        } => {
            println!("Success after {} attempts in {:?}: {}", attempts, elapsed, value);
        }
        RetryOutcome::Exhausted {
            last_error,
            attempts,
            ..
        } => {
            println!("Failed after {} attempts: {}", attempts, last_error);
        }
    }
}

// ==================== Backoff Schedules ====================

/// Example 2: Inspecting backoff schedules
///
/// Policies are pure data, so their delay schedules can be printed
/// without running anything.
fn example_backoff_schedules() {
    println!("\n=== Example 2: Backoff Schedules ===");

    let fixed = RetryPolicy::fixed(Duration::from_millis(100), 5);
    println!("Fixed delays:");
    for i in 0..4 {
        println!("  Retry {}: {:?}", i + 1, fixed.backoff_delay(i));
    }

    let exponential =
        RetryPolicy::exponential(Duration::from_millis(100), 2.0, Duration::from_millis(500), 6);
    println!("\nDoubling delays, capped at 500ms:");
    for i in 0..5 {
        println!("  Retry {}: {:?}", i + 1, exponential.backoff_delay(i));
    }

    // Jitter draws from the caller's RNG, so a seeded RNG gives a
    // reproducible schedule.
    let mut rng = StdRng::seed_from_u64(42);
    println!("\nSame schedule with full jitter:");
    for i in 0..5 {
        let jittered = Jitter::Full.apply(exponential.backoff_delay(i), &mut rng);
        println!("  Retry {}: {:?}", i + 1, jittered);
    }
}

// ==================== Conditional Retry ====================

/// Example 3: Retry only on specific errors
///
/// Demonstrates retry_if to distinguish transient from permanent errors.
async fn example_conditional_retry() {
    println!("\n=== Example 3: Conditional Retry ===");

    #[derive(Debug, Clone)]
    enum HttpError {
        Timeout,
        ServerError(u16),
        ClientError(u16),
    }

    impl std::fmt::Display for HttpError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                HttpError::Timeout => write!(f, "request timed out"),
                HttpError::ServerError(code) => write!(f, "server error: {}", code),
                HttpError::ClientError(code) => write!(f, "client error: {}", code),
            }
        }
    }

    // Only retry on timeouts and server errors, not client errors
    fn is_retryable(err: &HttpError) -> bool {
        matches!(err, HttpError::Timeout | HttpError::ServerError(_))
    }

    let attempts = Arc::new(AtomicU32::new(0));

    // Simulate an API that fails twice with retryable errors then succeeds
    let outcome = retry_if(
        {
            let attempts = attempts.clone();
            move || {
                let attempts = attempts.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    println!("  HTTP request attempt {}", n + 1);
                    match n {
                        0 => Err(HttpError::ServerError(503)),
                        1 => Err(HttpError::Timeout),
                        _ => Ok("{ \"status\": \"ok\" }"),
                    }
                }
            }
        },
        RetryPolicy::exponential(Duration::from_millis(50), 2.0, Duration::from_secs(2), 5),
        is_retryable,
    );

    match outcome.await {
        RetryOutcome::Succeeded { value, .. } => println!("Response: {}", value),
        RetryOutcome::Exhausted { last_error, .. } => println!("Request failed: {}", last_error),
    }

    // Client errors are not retried
    println!("\n--- Client Error (should NOT retry) ---");
    let attempts = Arc::new(AtomicU32::new(0));

    let outcome = retry_if(
        {
            let attempts = attempts.clone();
            move || {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    println!("  HTTP request attempt");
                    Err::<&str, _>(HttpError::ClientError(400))
                }
            }
        },
        RetryPolicy::exponential(Duration::from_millis(50), 2.0, Duration::from_secs(2), 5),
        is_retryable,
    )
    .await;

    if let RetryOutcome::Exhausted { last_error, .. } = outcome {
        println!("Request failed (no retries for client error): {}", last_error);
    }
    println!("Total attempts: {}", attempts.load(Ordering::SeqCst));
}

// ==================== Retry with Observability ====================

/// Example 4: Retry with hooks for logging/metrics
///
/// Demonstrates retry_with_hooks for observability.
async fn example_retry_with_hooks() {
    println!("\n=== Example 4: Retry with Hooks ===");

    let attempts = Arc::new(AtomicU32::new(0));

    let outcome = retry_with_hooks(
        {
            let attempts = attempts.clone();
            move || {
                let attempts = attempts.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    if n < 3 {
                        Err(format!("error on attempt {}", n + 1))
                    } else {
                        Ok("finally succeeded!")
                    }
                }
            }
        },
        RetryPolicy::exponential(Duration::from_millis(25), 2.0, Duration::from_secs(1), 5),
        |attempt, decision| {
            println!(
                "  [HOOK] Attempt {} failed with: {:?}",
                attempt.index + 1,
                attempt.error
            );
            match decision.delay() {
                Some(delay) => println!("         Waiting {:?} before retry...", delay),
                None => println!("         No more retries!"),
            }
            println!("         Total elapsed: {:?}", attempt.elapsed);
        },
    )
    .await;

    match outcome {
        RetryOutcome::Succeeded {
            value, attempts, ..
        } => println!("\nSuccess after {} attempts: {}", attempts, value),
        RetryOutcome::Exhausted {
            last_error,
            attempts,
            ..
        } => println!("\nFailed after {} attempts: {}", attempts, last_error),
    }
}

// ==================== Deadline ====================

/// Example 5: Bounding a run with a deadline
///
/// Demonstrates giving up once the elapsed time crosses a wall-clock
/// budget, even while attempts remain.
async fn example_deadline() {
    println!("\n=== Example 5: Deadline ===");

    let attempts = Arc::new(AtomicU32::new(0));

    let outcome = retry(
        {
            let attempts = attempts.clone();
            move || {
                let attempts = attempts.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    println!("  Attempt {}", n + 1);
                    Err::<(), _>("still down")
                }
            }
        },
        RetryPolicy::fixed(Duration::from_millis(100), 100)
            .with_deadline(Duration::from_millis(350)),
    )
    .await;

    if let RetryOutcome::Exhausted {
        attempts, elapsed, ..
    } = outcome
    {
        println!(
            "Gave up after {} attempts, {:?} elapsed (budget was 350ms)",
            attempts, elapsed
        );
    }
}

#[tokio::main]
async fn main() {
    println!("======================================");
    println!("        Retry Basics Example          ");
    println!("======================================");

    example_basic_retry().await;
    example_backoff_schedules();
    example_conditional_retry().await;
    example_retry_with_hooks().await;
    example_deadline().await;

    println!("\n======================================");
    println!("           Examples Complete           ");
    println!("======================================");
}
