//! Activity retry backoff.
//!
//! `backoff_delay` is a pure function of `(attempt, policy)` so the same
//! schedule is computed during replay and live execution. Jitter is applied
//! only to live delays and never feeds back into History.

use std::time::Duration;

use anchorage_types::workflow::RetryPolicy;
use rand::Rng;

/// Delay to wait after attempt `attempt` (1-based) has failed:
/// `min(initial_interval * backoff_coefficient^(attempt - 1), max_interval)`.
///
/// A zero `max_interval` leaves the delay uncapped. Overflow saturates at
/// `Duration::MAX` instead of panicking.
pub fn backoff_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let exponent = i32::try_from(attempt.max(1) - 1).unwrap_or(i32::MAX);
    let secs = policy.initial_interval.as_secs_f64() * policy.backoff_coefficient.powi(exponent);
    let raw = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
    if policy.max_interval.is_zero() {
        raw
    } else {
        raw.min(policy.max_interval)
    }
}

/// Whether another attempt is allowed after `attempt` attempts have run.
pub fn should_retry(attempt: u32, policy: &RetryPolicy) -> bool {
    policy.max_attempts == 0 || attempt < policy.max_attempts
}

/// Spread `delay` by a symmetric `fraction` (0.2 = +/-20%) drawn from `rng`.
///
/// Instances retrying the same activity at the same attempt spread apart.
/// The result never exceeds `cap` when `cap` is non-zero and saturates at
/// `Duration::MAX` instead of overflowing.
pub fn apply_jitter<R: Rng>(delay: Duration, fraction: f64, cap: Duration, rng: &mut R) -> Duration {
    if fraction <= 0.0 || delay.is_zero() {
        return delay;
    }
    let unit: f64 = rng.gen_range(-1.0..=1.0);
    let factor = (1.0 + unit * fraction.min(1.0)).max(0.0);
    let jittered = Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(Duration::MAX);
    if cap.is_zero() {
        jittered
    } else {
        jittered.min(cap)
    }
}
