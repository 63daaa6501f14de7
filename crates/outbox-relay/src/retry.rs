//! Retry policy for failed publishes.

use std::time::Duration;

use tracing::warn;

/// The outcome of [`RetryPolicy::next_attempt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextAttempt {
    /// How long to wait before the message may be claimed again.
    pub delay: Duration,
    /// `true` when attempts are exhausted and the message should be dead-lettered.
    pub is_final: bool,
}

/// Exponential backoff with a dead-letter cutoff.
///
/// # Backoff Calculation
///
/// After the `n`th failed attempt the message waits
/// `min(initial_backoff * multiplier^n, max_backoff)`, and is dead-lettered
/// once `n >= max_attempts`.
///
/// With defaults (1s, x2.0, 5m cap, 5 attempts):
/// - Failure 1: retry after 2s
/// - Failure 2: retry after 4s
/// - Failure 3: retry after 8s
/// - Failure 4: retry after 16s
/// - Failure 5: dead letter
///
/// Out-of-range settings are not rejected. [`RetryPolicy::next_attempt`]
/// computes with the defaults in their place, and [`RetryPolicy::normalized`]
/// rewrites them (with a warning) so the stored settings match.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use outbox_relay::RetryPolicy;
///
/// let policy = RetryPolicy::default();
/// let next = policy.next_attempt(1);
/// assert_eq!(next.delay, Duration::from_secs(2));
/// assert!(!next.is_final);
///
/// let strict = RetryPolicy {
///     max_attempts: 10,
///     initial_backoff: Duration::from_millis(500),
///     max_backoff: Duration::from_secs(60),
///     multiplier: 1.5,
/// };
/// assert!(strict.next_attempt(10).is_final);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Failed attempts after which a message is dead-lettered. Default: 5.
    pub max_attempts: u32,

    /// Base delay for exponential backoff. Default: 1 second.
    pub initial_backoff: Duration,

    /// Cap on the delay between attempts. Default: 5 minutes.
    pub max_backoff: Duration,

    /// Growth factor per failed attempt. Default: 2.0.
    pub multiplier: f64,
}

impl RetryPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
    pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
    pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(300);
    pub const DEFAULT_MULTIPLIER: f64 = 2.0;

    /// Replace invalid settings with their defaults.
    ///
    /// Zero attempts, zero durations, and multipliers that do not grow
    /// (`<= 1.0` or NaN) are each logged and defaulted.
    pub fn normalized(self) -> Self {
        let mut policy = self;

        if policy.max_attempts == 0 {
            warn!("retry max_attempts is 0, using {}", Self::DEFAULT_MAX_ATTEMPTS);
            policy.max_attempts = Self::DEFAULT_MAX_ATTEMPTS;
        }
        if policy.initial_backoff.is_zero() {
            warn!(
                "retry initial_backoff is 0, using {:?}",
                Self::DEFAULT_INITIAL_BACKOFF
            );
            policy.initial_backoff = Self::DEFAULT_INITIAL_BACKOFF;
        }
        if policy.max_backoff.is_zero() {
            warn!("retry max_backoff is 0, using {:?}", Self::DEFAULT_MAX_BACKOFF);
            policy.max_backoff = Self::DEFAULT_MAX_BACKOFF;
        }
        // Written so NaN also falls through to the default.
        if !(policy.multiplier > 1.0) {
            warn!(
                multiplier = policy.multiplier,
                "retry multiplier must be > 1.0, using {}",
                Self::DEFAULT_MULTIPLIER
            );
            policy.multiplier = Self::DEFAULT_MULTIPLIER;
        }

        policy
    }

    /// Backoff and dead-letter decision after `attempts` failed attempts.
    ///
    /// Pure: the same input always yields the same output. Invalid settings
    /// are read as their defaults.
    pub fn next_attempt(&self, attempts: u32) -> NextAttempt {
        NextAttempt {
            delay: self.backoff_duration(attempts),
            is_final: attempts >= self.effective_max_attempts(),
        }
    }

    /// `min(initial_backoff * multiplier^attempts, max_backoff)`.
    ///
    /// Saturates at `max_backoff` instead of overflowing for large `attempts`.
    pub fn backoff_duration(&self, attempts: u32) -> Duration {
        let max_backoff = self.effective_max_backoff();
        let exponent = i32::try_from(attempts).unwrap_or(i32::MAX);
        let secs = self.effective_initial_backoff().as_secs_f64()
            * self.effective_multiplier().powi(exponent);

        match Duration::try_from_secs_f64(secs) {
            Ok(delay) => delay.min(max_backoff),
            Err(_) => max_backoff,
        }
    }

    fn effective_max_attempts(&self) -> u32 {
        match self.max_attempts {
            0 => Self::DEFAULT_MAX_ATTEMPTS,
            n => n,
        }
    }

    fn effective_initial_backoff(&self) -> Duration {
        if self.initial_backoff.is_zero() {
            Self::DEFAULT_INITIAL_BACKOFF
        } else {
            self.initial_backoff
        }
    }

    fn effective_max_backoff(&self) -> Duration {
        if self.max_backoff.is_zero() {
            Self::DEFAULT_MAX_BACKOFF
        } else {
            self.max_backoff
        }
    }

    fn effective_multiplier(&self) -> f64 {
        // NaN falls through to the default.
        if self.multiplier > 1.0 {
            self.multiplier
        } else {
            Self::DEFAULT_MULTIPLIER
        }
    }

    /// Returns `true` if another attempt should follow `attempts` failures.
    pub fn should_retry(&self, attempts: u32) -> bool {
        !self.next_attempt(attempts).is_final
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            initial_backoff: Self::DEFAULT_INITIAL_BACKOFF,
            max_backoff: Self::DEFAULT_MAX_BACKOFF,
            multiplier: Self::DEFAULT_MULTIPLIER,
        }
    }
}
