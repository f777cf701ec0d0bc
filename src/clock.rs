//! Clock and retry primitives (component A): monotonic sleep, jittered
//! backoff, and the exponential-backoff formula shared by the queue and
//! the scheduler.

use rand::Rng;
use std::time::Duration;

/// Sleep for the given duration. A thin wrapper so every suspension
/// point in the core goes through one seam.
pub async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await;
}

/// Returns `base` plus a uniform random jitter in `[0, base]`, used to
/// desynchronize the scheduler's per-term enqueue (spec §4.H: jitter
/// uniformly in `[0, 60s]`).
pub fn jittered(max: Duration) -> Duration {
    let millis = max.as_millis().max(1) as u64;
    Duration::from_millis(rand::rng().random_range(0..=millis))
}

/// `base * 2^(attempt-1)`, capped at `cap`. Mirrors the teacher's
/// `2i64.pow(retry_count).min(3600)` retry-delay formula.
pub fn exponential_backoff(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    let scaled = base.as_millis().saturating_mul(factor as u128);
    Duration::from_millis(scaled.min(cap.as_millis()) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_secs(2);
        let cap = Duration::from_secs(3600);
        assert_eq!(exponential_backoff(1, base, cap), Duration::from_secs(2));
        assert_eq!(exponential_backoff(2, base, cap), Duration::from_secs(4));
        assert_eq!(exponential_backoff(3, base, cap), Duration::from_secs(8));
    }

    #[test]
    fn backoff_respects_cap() {
        let base = Duration::from_secs(2);
        let cap = Duration::from_secs(10);
        assert_eq!(exponential_backoff(10, base, cap), cap);
    }

    #[test]
    fn jitter_never_exceeds_max() {
        let max = Duration::from_secs(60);
        for _ in 0..100 {
            assert!(jittered(max) <= max);
        }
    }
}
