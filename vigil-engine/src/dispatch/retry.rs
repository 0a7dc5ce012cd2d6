//! Retry backoff for action delivery.

use std::time::Duration;

use rand::Rng;
use vigil_core::RetryPolicy;

/// Backoff before retry number `attempt` (0-based), without jitter.
pub fn base_backoff_ms(policy: &RetryPolicy, attempt: u32) -> u64 {
    let multiplier = if policy.backoff_multiplier.is_finite() {
        policy.backoff_multiplier.max(1.0)
    } else {
        1.0
    };
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let base = policy.initial_backoff_ms as f64 * multiplier.powi(exponent);
    base.min(policy.max_backoff_ms as f64) as u64
}

/// Capped exponential backoff plus up to 25% random jitter.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let capped = base_backoff_ms(policy, attempt);
    let jitter = (capped as f64 * 0.25 * rand::thread_rng().r#gen::<f64>()) as u64;
    Duration::from_millis(capped + jitter)
}
