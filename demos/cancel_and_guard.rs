//! Cancellation and Guard Example
//!
//! Demonstrates scheduler-backed retry runs. Shows practical patterns
//! including:
//! - Driving a retry run on the current tokio runtime
//! - Cancelling a run between attempts
//! - Running attempts on a dedicated worker pool
//! - Catching flagged blocking calls with the guard

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ebbtide::{guard, BlockingScope, RetryController, RetryOutcome, RetryPolicy, TokioScheduler};

// ==================== Controller Basics ====================

/// Example 1: A retry run on the current runtime
///
/// The controller returns immediately; attempts advance as scheduled
/// tasks while the caller does other work or awaits the outcome.
async fn example_controller_basics() {
    println!("\n=== Example 1: Controller Basics ===");

    let attempts = Arc::new(AtomicU32::new(0));
    let scheduler = Arc::new(TokioScheduler::current());

    let mut controller = RetryController::start(
        scheduler,
        {
            let attempts = attempts.clone();
            move || {
                let attempts = attempts.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    println!("  Attempt {}", n + 1);
                    if n < 2 {
                        Err("connection refused")
                    } else {
                        Ok("connected")
                    }
                }
            }
        },
        RetryPolicy::exponential(Duration::from_millis(50), 2.0, Duration::from_secs(1), 5),
    );

    println!("  State right after start: {:?}", controller.state());

    match controller.outcome().await {
        Some(RetryOutcome::Succeeded {
            value, attempts, ..
        }) => println!("  Success after {} attempts: {}", attempts, value),
        Some(RetryOutcome::Exhausted {
            last_error,
            attempts,
            ..
        }) => println!("  Failed after {} attempts: {}", attempts, last_error),
        None => println!("  Run was cancelled"),
    }
    println!("  Final state: {:?}", controller.state());
}

// ==================== Cancellation ====================

/// Example 2: Cancelling a run between attempts
///
/// Cancellation never interrupts a running invocation; it stops the
/// pending timer and suppresses any further work.
async fn example_cancellation() {
    println!("\n=== Example 2: Cancellation ===");

    let attempts = Arc::new(AtomicU32::new(0));
    let scheduler = Arc::new(TokioScheduler::current());

    let mut controller = RetryController::start(
        scheduler,
        {
            let attempts = attempts.clone();
            move || {
                let attempts = attempts.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    println!("  Attempt {} fails", n + 1);
                    Err::<(), _>("still down")
                }
            }
        },
        RetryPolicy::fixed(Duration::from_secs(1), 10),
    );

    // Let the first attempt fail, then cancel during its backoff.
    tokio::time::sleep(Duration::from_millis(200)).await;
    println!("  State before cancel: {:?}", controller.state());
    controller.cancel();

    match controller.outcome().await {
        None => println!("  Run cancelled; no outcome delivered"),
        Some(outcome) => println!("  Unexpected outcome: {:?}", outcome),
    }
    println!(
        "  Attempts started: {} (the second never ran)",
        controller.attempts_started()
    );
}

// ==================== Dedicated Pool ====================

/// Example 3: Attempts on a dedicated worker pool
///
/// Useful when retry work should not share the caller's runtime.
async fn example_dedicated_pool() {
    println!("\n=== Example 3: Dedicated Pool ===");

    let scheduler =
        Arc::new(TokioScheduler::dedicated(2).expect("failed to build worker pool"));
    let attempts = Arc::new(AtomicU32::new(0));

    let mut controller = RetryController::start(
        scheduler,
        {
            let attempts = attempts.clone();
            move || {
                let attempts = attempts.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    let thread = std::thread::current()
                        .name()
                        .unwrap_or("unnamed")
                        .to_owned();
                    println!("  Attempt {} on thread {:?}", n + 1, thread);
                    if n < 1 {
                        Err("warming up")
                    } else {
                        Ok("ready")
                    }
                }
            }
        },
        RetryPolicy::fixed(Duration::from_millis(100), 5),
    );

    if let Some(RetryOutcome::Succeeded {
        value, attempts, ..
    }) = controller.outcome().await
    {
        println!("  Success after {} attempts: {}", attempts, value);
    }
}

// ==================== Blocking-Call Guard ====================

/// Example 4: Catching flagged blocking calls
///
/// The guard is advisory: it flags calls routed through the wrappers in
/// `ebbtide::guard` while a wrapped future is being polled.
async fn example_blocking_guard() {
    println!("\n=== Example 4: Blocking-Call Guard ===");

    let scope = BlockingScope::new();
    let result = scope
        .wrap(async {
            println!("  Calling a flagged blocking API inside a guarded future...");
            guard::sleep(Duration::from_millis(5))
        })
        .await;

    match result {
        Err(violation) => println!("  Caught: {}", violation),
        Ok(()) => println!("  No violation detected"),
    }

    // guard::allow opts a known-safe section out of detection.
    let scope = BlockingScope::new();
    let result = scope
        .wrap(async { guard::allow(|| guard::sleep(Duration::from_millis(5))) })
        .await;
    println!("  With guard::allow the same call passes: {}", result.is_ok());
}

#[tokio::main]
async fn main() {
    // Set up tracing subscriber
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    tracing::info!("Starting cancellation and guard demo");

    println!("======================================");
    println!("    Cancellation and Guard Example    ");
    println!("======================================");

    example_controller_basics().await;
    example_cancellation().await;
    example_dedicated_pool().await;
    example_blocking_guard().await;

    println!("\n======================================");
    println!("           Examples Complete           ");
    println!("======================================");
}
