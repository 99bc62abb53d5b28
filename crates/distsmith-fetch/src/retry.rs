//! Backoff policy for download attempts.
//!
//! Attempt `k` (1-indexed retries) sleeps `base * 2^(k-1)`, capped, with an
//! optional jitter factor for fleets that hammer the same upstream.

use std::time::Duration;

/// Cap on any single backoff sleep.
pub const MAX_BACKOFF: Duration = Duration::from_secs(120);

/// Delay before retry attempt `retry` (1 = first retry). Exponential from
/// `base`, capped at [`MAX_BACKOFF`].
pub fn backoff_delay(base: Duration, retry: u32) -> Duration {
    if retry == 0 {
        return Duration::ZERO;
    }
    let pow = retry.saturating_sub(1).min(16);
    base.saturating_mul(2_u32.saturating_pow(pow)).min(MAX_BACKOFF)
}

/// [`backoff_delay`] with a jitter factor: 0.3 spreads the delay over
/// ±30%. A factor of 0 is exact.
pub fn backoff_delay_jittered(base: Duration, retry: u32, jitter: f64) -> Duration {
    let delay = backoff_delay(base, retry);
    if jitter <= 0.0 || delay.is_zero() {
        return delay;
    }
    use rand::RngExt;
    let factor = 1.0 - jitter + rand::rng().random::<f64>() * 2.0 * jitter;
    let millis = (delay.as_millis() as f64 * factor).round() as u64;
    Duration::from_millis(millis)
}
