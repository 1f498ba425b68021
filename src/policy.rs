//! Retry policy types and configuration.

use std::time::Duration;

use rand::Rng;

/// A retry policy describing when to retry and how long to wait.
///
/// Policies are pure data: they decide, they never execute. Feeding the
/// same [`Attempt`] and RNG state to [`RetryPolicy::decide`] always yields
/// the same [`RetryDecision`], which makes policies easy to test, clone,
/// and inspect.
///
/// `max_attempts` counts total invocations, including the first one.
/// A policy with `max_attempts = 5` invokes the operation at most five
/// times and waits out at most four delays.
///
/// # Examples
///
/// ```rust
/// use ebbtide::{Jitter, RetryPolicy};
/// use std::time::Duration;
///
/// // Same delay before every retry, at most 5 invocations.
/// let policy = RetryPolicy::fixed(Duration::from_millis(500), 5);
/// assert_eq!(policy.max_attempts(), 5);
///
/// // Delay grows tenfold per attempt, capped at one second.
/// let policy = RetryPolicy::exponential(
///     Duration::from_millis(10),
///     10.0,
///     Duration::from_millis(1000),
///     5,
/// )
/// .with_jitter(Jitter::Full);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    multiplier: f64,
    max_delay: Option<Duration>,
    jitter: Jitter,
    deadline: Option<Duration>,
}

/// Strategy for adding randomness to computed delays.
///
/// Jitter is applied after the backoff computation and the cap, and the
/// result never exceeds the pre-jitter delay, so a capped delay stays
/// capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    /// No jitter applied.
    #[default]
    None,
    /// Random delay between zero and the computed delay.
    Full,
    /// Random delay between half and all of the computed delay.
    Half,
}

/// One failed invocation, as seen by a policy.
///
/// Produced by the retry drivers and passed to [`RetryPolicy::decide`]
/// and observability hooks.
#[derive(Debug, Clone)]
pub struct Attempt<'a, E> {
    /// Which invocation just failed (0-indexed).
    pub index: u32,
    /// The error from the failed invocation.
    pub error: &'a E,
    /// Time elapsed since the first invocation began.
    pub elapsed: Duration,
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this long, then invoke the operation again.
    Retry(Duration),
    /// Stop retrying; the error becomes terminal.
    GiveUp,
}

impl RetryDecision {
    /// Returns true if the decision is to retry.
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry(_))
    }

    /// Returns true if the decision is to give up.
    pub fn is_give_up(&self) -> bool {
        matches!(self, Self::GiveUp)
    }

    /// The delay to wait, if retrying.
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Self::Retry(delay) => Some(*delay),
            Self::GiveUp => None,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the same delay before every retry.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use ebbtide::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::fixed(Duration::from_millis(500), 3);
    ///
    /// assert_eq!(policy.backoff_delay(0), Duration::from_millis(500));
    /// assert_eq!(policy.backoff_delay(1), Duration::from_millis(500));
    /// assert_eq!(policy.backoff_delay(2), Duration::from_millis(500));
    /// ```
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            multiplier: 1.0,
            max_delay: None,
            jitter: Jitter::None,
            deadline: None,
        }
    }

    /// Create a policy whose delay grows by `multiplier` per attempt,
    /// capped at `max_delay`.
    ///
    /// Delay before retry N is `base_delay * multiplier^N`, clamped to
    /// `max_delay`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use ebbtide::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::exponential(
    ///     Duration::from_millis(10),
    ///     10.0,
    ///     Duration::from_millis(1000),
    ///     5,
    /// );
    ///
    /// assert_eq!(policy.backoff_delay(0), Duration::from_millis(10));
    /// assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
    /// assert_eq!(policy.backoff_delay(2), Duration::from_millis(1000));
    /// assert_eq!(policy.backoff_delay(3), Duration::from_millis(1000)); // capped
    /// ```
    pub fn exponential(
        base_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            max_attempts,
            base_delay,
            multiplier,
            max_delay: Some(max_delay),
            jitter: Jitter::None,
            deadline: None,
        }
    }

    /// Set the jitter strategy.
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the maximum delay cap.
    ///
    /// Delays never exceed this value, whatever the multiplier produces.
    pub fn with_max_delay(mut self, d: Duration) -> Self {
        self.max_delay = Some(d);
        self
    }

    /// Set an overall wall-clock budget for the whole retry run.
    ///
    /// Once the elapsed time of a failed attempt reaches the deadline,
    /// [`RetryPolicy::decide`] gives up even if attempts remain.
    pub fn with_deadline(mut self, d: Duration) -> Self {
        self.deadline = Some(d);
        self
    }

    /// Get the maximum number of invocations, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Get the base delay.
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Get the per-attempt delay multiplier.
    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Get the maximum delay cap.
    pub fn max_delay(&self) -> Option<Duration> {
        self.max_delay
    }

    /// Get the jitter strategy.
    pub fn jitter(&self) -> Jitter {
        self.jitter
    }

    /// Get the overall wall-clock budget.
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// Validate the policy configuration.
    ///
    /// Returns an error message if the policy could never retry sensibly.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.max_attempts == 0 {
            return Err("RetryPolicy requires max_attempts >= 1");
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err("RetryPolicy requires multiplier >= 1");
        }
        if let Some(max) = self.max_delay {
            if self.base_delay > max {
                return Err("RetryPolicy requires base_delay <= max_delay");
            }
        }
        Ok(())
    }

    /// Compute the pre-jitter delay before retry `index` (0-indexed).
    ///
    /// Saturates at the cap, or at `Duration::MAX` for an uncapped policy,
    /// when the multiplication overflows.
    pub fn backoff_delay(&self, index: u32) -> Duration {
        let delay = if self.multiplier == 1.0 {
            self.base_delay
        } else {
            let scaled = self.base_delay.as_secs_f64() * self.multiplier.powf(f64::from(index));
            Duration::try_from_secs_f64(scaled).unwrap_or(Duration::MAX)
        };
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// Decide what to do after the given failed attempt.
    ///
    /// Gives up when the attempt budget is spent or the deadline has
    /// passed; otherwise returns the jittered backoff delay. Randomness
    /// comes only from the caller's RNG, so a seeded RNG makes the
    /// decision fully deterministic.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use ebbtide::{Attempt, RetryDecision, RetryPolicy};
    /// use rand::rngs::StdRng;
    /// use rand::SeedableRng;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::fixed(Duration::from_millis(10), 3);
    /// let mut rng = StdRng::seed_from_u64(1);
    /// let error = "timeout";
    ///
    /// let first = Attempt { index: 0, error: &error, elapsed: Duration::ZERO };
    /// assert_eq!(
    ///     policy.decide(&first, &mut rng),
    ///     RetryDecision::Retry(Duration::from_millis(10)),
    /// );
    ///
    /// // Attempt index 2 is the third and last permitted invocation.
    /// let last = Attempt { index: 2, error: &error, elapsed: Duration::from_millis(20) };
    /// assert_eq!(policy.decide(&last, &mut rng), RetryDecision::GiveUp);
    /// ```
    pub fn decide<E, R>(&self, attempt: &Attempt<'_, E>, rng: &mut R) -> RetryDecision
    where
        R: Rng + ?Sized,
    {
        if attempt.index.saturating_add(1) >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        if let Some(deadline) = self.deadline {
            if attempt.elapsed >= deadline {
                return RetryDecision::GiveUp;
            }
        }
        let delay = self.jitter.apply(self.backoff_delay(attempt.index), rng);
        RetryDecision::Retry(delay)
    }
}

impl Jitter {
    /// Apply jitter to a computed delay using the provided RNG.
    ///
    /// The result never exceeds `delay`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use ebbtide::Jitter;
    /// use rand::rngs::StdRng;
    /// use rand::SeedableRng;
    /// use std::time::Duration;
    ///
    /// let mut rng = StdRng::seed_from_u64(7);
    /// let jittered = Jitter::Full.apply(Duration::from_millis(100), &mut rng);
    /// assert!(jittered <= Duration::from_millis(100));
    /// ```
    pub fn apply<R>(&self, delay: Duration, rng: &mut R) -> Duration
    where
        R: Rng + ?Sized,
    {
        match self {
            Jitter::None => delay,
            Jitter::Full => rng.random_range(Duration::ZERO..=delay),
            Jitter::Half => rng.random_range(delay / 2..=delay),
        }
    }
}
