//! Exponential backoff shared by the fetcher, the monitor and promotion.

use std::time::Duration;

use rand::Rng;

/// Calculate exponential backoff delay.
///
/// Formula: min(base_ms * 2^attempt, max_ms)
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let backoff = base_ms.saturating_mul(2u64.saturating_pow(attempt));
    Duration::from_millis(backoff.min(max_ms))
}

/// Add up to 10% random jitter so retries of many applications spread out.
pub fn jittered(delay: Duration) -> Duration {
    let spread = u64::try_from(delay.as_millis() / 10).unwrap_or(u64::MAX);
    if spread == 0 {
        return delay;
    }
    let extra = rand::thread_rng().gen_range(0..=spread);
    delay.saturating_add(Duration::from_millis(extra))
}
