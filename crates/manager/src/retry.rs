//! Retry eligibility and backoff delays.

use std::time::Duration;

use rand::Rng;

use conductor_core::{ErrorKind, RetryPolicy};

/// Whether another attempt should be scheduled after a failure.
///
/// `attempts_so_far` counts every attempt already made, including the one
/// that just failed. Terminal error kinds (validation, config, permission,
/// cancellation) never retry regardless of the budget.
pub fn should_retry(policy: &RetryPolicy, kind: Option<ErrorKind>, attempts_so_far: u32) -> bool {
    if attempts_so_far >= policy.max_attempts {
        return false;
    }
    // An executor failure without a kind is treated as opaque and transient.
    kind.map_or(true, |k| k.is_retryable())
}

/// Delay before attempt `n` (n ≥ 2): `min(max_delay, base · mult^(n−2))`,
/// then jittered by ±`jitter` fraction and clamped to ≥ 0.
pub fn retry_delay(policy: &RetryPolicy, next_attempt: u32) -> Duration {
    let exponent = next_attempt.saturating_sub(2);
    let base = policy.base_delay_ms as f64;
    let raw = base * policy.backoff_multiplier.powi(exponent as i32);
    let capped = raw.min(policy.max_delay_ms as f64);

    let jittered = if policy.jitter > 0.0 {
        let low = capped * (1.0 - policy.jitter);
        let high = capped * (1.0 + policy.jitter);
        if high > low {
            rand::thread_rng().gen_range(low..=high)
        } else {
            capped
        }
    } else {
        capped
    };

    Duration::from_millis(jittered.max(0.0) as u64)
}
