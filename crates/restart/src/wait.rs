//! Bounded polling.

use std::future::Future;
use std::time::Duration;

use tracing::trace;

/// Number of predicate evaluations a `timeout`/`interval` pair allows.
///
/// Always at least one, so a zero timeout still checks once.
#[must_use]
pub fn max_attempts(timeout: Duration, interval: Duration) -> u32 {
    if interval.is_zero() {
        return 1;
    }
    let attempts = timeout.as_nanos().div_ceil(interval.as_nanos());
    u32::try_from(attempts).unwrap_or(u32::MAX).max(1)
}

/// Poll `predicate` every `interval` until it returns `true` or `timeout`
/// worth of attempts is used up.
///
/// Returns whether the predicate was satisfied. The sleep is skipped after
/// the final attempt.
pub async fn wait_until<F, Fut>(timeout: Duration, interval: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let attempts = max_attempts(timeout, interval);
    for attempt in 1..=attempts {
        if predicate().await {
            return true;
        }
        trace!(attempt, attempts, "Condition not met yet");
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    false
}
