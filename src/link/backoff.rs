//! Exponential backoff for link redial attempts

use std::time::{Duration, SystemTime};

/// Controls how long a link waits between reconnect attempts.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay between attempts (doubles each attempt)
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Compute the delay before reconnect attempt `attempt` (zero-based).
///
/// Follows `min(base_delay * 2^attempt + jitter, max_delay)`. Jitter is
/// 0-25% of the computed delay, derived from the subsecond clock so that
/// a restarted subtree does not redial its parent in lockstep.
#[must_use]
pub fn delay_for_attempt(policy: &BackoffPolicy, attempt: u32) -> Duration {
    let base = policy
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt));
    let base = base.min(policy.max_delay);

    let jitter_nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();

    // Scale to 0-25% of the base delay
    let jitter_fraction = (jitter_nanos % 250) as f64 / 1000.0;
    let jitter = base.mul_f64(jitter_fraction);

    (base + jitter).min(policy.max_delay)
}
