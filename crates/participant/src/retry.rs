//! Backoff schedule helpers.

use std::time::Duration;

use saga_core::RetryPolicy;

/// Maximum additive jitter in milliseconds.
const JITTER_MAX_MS: u64 = 25;

/// Returns the delay before the given retry: exponential backoff from
/// the policy plus additive jitter.
///
/// `retry` is zero-based: 0 is the delay between the first and second
/// attempts.
pub fn delay_with_jitter(policy: &RetryPolicy, retry: u32) -> Duration {
    policy.delay_for_retry(retry) + Duration::from_millis(rand_jitter())
}

/// Generates random jitter for backoff (0-25ms).
fn rand_jitter() -> u64 {
    // Simple linear congruential generator for jitter
    // (avoids full rand dependency for this simple case)
    use std::time::SystemTime;
    let seed = u64::from(
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos(),
    );
    seed % JITTER_MAX_MS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_stays_within_jitter_band() {
        let policy = RetryPolicy::default();
        for retry in 0..6 {
            let base = policy.delay_for_retry(retry);
            let delay = delay_with_jitter(&policy, retry);
            assert!(delay >= base);
            assert!(delay < base + Duration::from_millis(JITTER_MAX_MS));
        }
    }

    #[test]
    fn test_capped_delay_keeps_jitter_bounded() {
        let policy = RetryPolicy {
            base_ms: 50,
            factor: 2,
            cap_ms: 100,
            max_attempts: 10,
        };
        let delay = delay_with_jitter(&policy, 8);
        assert!(delay >= Duration::from_millis(100));
        assert!(delay < Duration::from_millis(100 + JITTER_MAX_MS));
    }
}
