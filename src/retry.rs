//! Exponential backoff with jitter, shared by the admission queue and the
//! connection pool.

use std::time::Duration;

use rand::Rng;

/// Jitter range applied around the capped exponential delay (±20%).
pub const JITTER_FACTOR: f64 = 0.2;

/// Delay before retry number `attempt` (zero-based).
///
/// `min(max, base * 2^attempt)`, then scaled by a random factor in
/// `[1 - JITTER_FACTOR, 1 + JITTER_FACTOR)`.  The result never exceeds
/// `max * (1 + JITTER_FACTOR)`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let random: f64 = rand::rng().random();
    backoff_delay_with_random(attempt, base, max, random)
}

/// Deterministic variant of [`backoff_delay`]; `random` must be in `[0, 1)`.
pub fn backoff_delay_with_random(attempt: u32, base: Duration, max: Duration, random: f64) -> Duration {
    let base_ms = base.as_millis().min(u128::from(u64::MAX)) as u64;
    let max_ms = max.as_millis().min(u128::from(u64::MAX)) as u64;

    let exponential = base_ms.saturating_mul(1u64 << attempt.min(31));
    let capped = exponential.min(max_ms);

    let jitter = 1.0 + (random.clamp(0.0, 1.0) * 2.0 - 1.0) * JITTER_FACTOR;
    let with_jitter = (capped as f64 * jitter).round().max(0.0);

    Duration::from_millis(with_jitter as u64)
}
