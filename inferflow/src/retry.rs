//! Retry classification and backoff for the external inference call.
//!
//! Failures split into two classes: *retryable* (the service or the network
//! was momentarily unhealthy) and *fatal* (the request itself is wrong and
//! will keep failing). The durable [`RetryPolicy`] governs the engine's outer
//! retry loop; the inference client's inner loop uses the plain
//! [`bounded_backoff`] helper. The two layers compose, so their combined
//! attempt budget is validated at configuration load.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::errors::InferenceError;

/// Largest exponent the backoff doubling is allowed to reach.
const MAX_BACKOFF_EXPONENT: u32 = 10;

/// Whether a failed inference call is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Momentary failure; a later attempt may succeed.
    Retryable,
    /// Permanent failure; retrying would repeat the same rejection.
    Fatal,
}

/// Classifies a single inference failure.
///
/// Timeouts and connection drops are retryable. For HTTP failures the status
/// decides: 408 and 429 are explicit back-off signals, any 5xx is a server
/// fault, and every other 4xx means the request will never be accepted.
/// Failures carrying no status at all (including undecodable bodies) are
/// treated as retryable.
#[must_use]
pub const fn classify(error: &InferenceError) -> ErrorClass {
    match error {
        InferenceError::Timeout(_)
        | InferenceError::Connect { .. }
        | InferenceError::Decode { .. } => ErrorClass::Retryable,
        InferenceError::Http { status, .. } => classify_status(*status),
    }
}

/// Classifies a bare HTTP status code.
#[must_use]
pub const fn classify_status(status: u16) -> ErrorClass {
    match status {
        408 | 429 | 500..=599 => ErrorClass::Retryable,
        400..=499 => ErrorClass::Fatal,
        _ => ErrorClass::Retryable,
    }
}

/// Outcome of evaluating a failed attempt against a [`RetryPolicy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this long, then run the next attempt.
    Retry(Duration),
    /// The failure is permanent; retrying is pointless.
    Fatal,
    /// The attempt or cumulative-delay budget ran out.
    Exhausted,
}

/// Durable retry policy for the per-floor inference step.
///
/// Attempt counts include the first call: `max_attempts = 4` means one call
/// plus up to three retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles each retry after that.
    pub first_delay: Duration,
    /// Upper bound a single pre-jitter delay is clamped to.
    pub max_delay: Duration,
    /// Floor applied after jitter so a delay never rounds to zero.
    pub min_delay: Duration,
    /// Hard ceiling on cumulative backoff across all retries of one step.
    pub retry_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            first_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            min_delay: Duration::from_millis(50),
            retry_timeout: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the default production settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the total attempt budget.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the delay before the first retry.
    #[must_use]
    pub const fn with_first_delay(mut self, first_delay: Duration) -> Self {
        self.first_delay = first_delay;
        self
    }

    /// Sets the per-delay cap.
    #[must_use]
    pub const fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Sets the cumulative backoff ceiling.
    #[must_use]
    pub const fn with_retry_timeout(mut self, retry_timeout: Duration) -> Self {
        self.retry_timeout = retry_timeout;
        self
    }

    /// Backoff before retry `attempt_index` (0 = first retry).
    ///
    /// Exponential growth capped at `max_delay`, then ±20% uniform jitter,
    /// floored at `min_delay`. The exponent saturates so the doubling can
    /// never overflow.
    #[must_use]
    pub fn delay_for(&self, attempt_index: u32) -> Duration {
        let factor = 1u64 << attempt_index.min(MAX_BACKOFF_EXPONENT);
        let raw_ms = duration_ms(self.first_delay).saturating_mul(factor);
        let capped_ms = raw_ms.min(duration_ms(self.max_delay));
        let floor_ms = duration_ms(self.min_delay);
        Duration::from_millis(apply_jitter(capped_ms).max(floor_ms))
    }

    /// Decides what happens after a failed attempt.
    ///
    /// `attempts_made` counts attempts already executed (1-based);
    /// `cumulative` is the backoff already spent on this step, replayed
    /// delays included.
    #[must_use]
    pub fn evaluate(
        &self,
        error: &InferenceError,
        attempts_made: u32,
        cumulative: Duration,
    ) -> RetryDecision {
        if classify(error) == ErrorClass::Fatal {
            return RetryDecision::Fatal;
        }
        if attempts_made >= self.max_attempts {
            return RetryDecision::Exhausted;
        }
        let delay = self.delay_for(attempts_made.saturating_sub(1));
        if cumulative.saturating_add(delay) > self.retry_timeout {
            return RetryDecision::Exhausted;
        }
        RetryDecision::Retry(delay)
    }
}

/// Un-jittered exponential backoff for the client's inner attempt loop.
#[must_use]
pub fn bounded_backoff(base: Duration, max: Duration, attempt_index: u32) -> Duration {
    let factor = 1u64 << attempt_index.min(MAX_BACKOFF_EXPONENT);
    let raw_ms = duration_ms(base).saturating_mul(factor);
    Duration::from_millis(raw_ms.min(duration_ms(max)))
}

/// ±20% uniform jitter so synchronized clients fan out their retries.
fn apply_jitter(delay_ms: u64) -> u64 {
    let spread = delay_ms / 5;
    if spread == 0 {
        return delay_ms;
    }
    rand::thread_rng().gen_range(delay_ms - spread..=delay_ms + spread)
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(status: u16) -> InferenceError {
        InferenceError::http(status, "test")
    }

    #[test]
    fn test_classification_table() {
        assert_eq!(
            classify(&InferenceError::Timeout(Duration::from_secs(120))),
            ErrorClass::Retryable
        );
        assert_eq!(
            classify(&InferenceError::connect("refused")),
            ErrorClass::Retryable
        );
        assert_eq!(classify(&http(408)), ErrorClass::Retryable);
        assert_eq!(classify(&http(429)), ErrorClass::Retryable);
        assert_eq!(classify(&http(500)), ErrorClass::Retryable);
        assert_eq!(classify(&http(503)), ErrorClass::Retryable);
        assert_eq!(classify(&http(400)), ErrorClass::Fatal);
        assert_eq!(classify(&http(404)), ErrorClass::Fatal);
        assert_eq!(classify(&http(422)), ErrorClass::Fatal);
        assert_eq!(
            classify(&InferenceError::decode("trailing garbage")),
            ErrorClass::Retryable
        );
    }

    #[test]
    fn test_delay_grows_exponentially_within_jitter_bounds() {
        let policy = RetryPolicy::default();
        for (attempt, expected_ms) in [(0u32, 2_000u64), (1, 4_000), (2, 8_000), (3, 16_000)] {
            let delay = policy.delay_for(attempt);
            let ms = u64::try_from(delay.as_millis()).unwrap();
            let low = expected_ms - expected_ms / 5;
            let high = expected_ms + expected_ms / 5;
            assert!(
                (low..=high).contains(&ms),
                "attempt {attempt}: {ms}ms outside [{low}, {high}]"
            );
        }
    }

    #[test]
    fn test_delay_caps_before_jitter() {
        let policy = RetryPolicy::default();
        // 2s * 2^6 = 128s, well past the 30s cap.
        let ms = u64::try_from(policy.delay_for(6).as_millis()).unwrap();
        assert!((24_000..=36_000).contains(&ms), "{ms}ms outside capped band");
        // The exponent saturates; enormous indices behave like index 10.
        let ms = u64::try_from(policy.delay_for(u32::MAX).as_millis()).unwrap();
        assert!((24_000..=36_000).contains(&ms));
    }

    #[test]
    fn test_delay_respects_floor() {
        let policy = RetryPolicy::default()
            .with_first_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(2));
        assert!(policy.delay_for(0) >= policy.min_delay);
    }

    #[test]
    fn test_evaluate_fatal_short_circuits() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.evaluate(&http(400), 1, Duration::ZERO),
            RetryDecision::Fatal
        );
    }

    #[test]
    fn test_evaluate_attempt_budget() {
        let policy = RetryPolicy::default();
        assert!(matches!(
            policy.evaluate(&http(503), 1, Duration::ZERO),
            RetryDecision::Retry(_)
        ));
        assert!(matches!(
            policy.evaluate(&http(503), 3, Duration::ZERO),
            RetryDecision::Retry(_)
        ));
        assert_eq!(
            policy.evaluate(&http(503), 4, Duration::ZERO),
            RetryDecision::Exhausted
        );
    }

    #[test]
    fn test_evaluate_cumulative_ceiling() {
        let policy = RetryPolicy::default().with_retry_timeout(Duration::from_secs(3));
        // First retry wants ~2s; with 2s already spent the ceiling is crossed.
        assert_eq!(
            policy.evaluate(&http(503), 2, Duration::from_secs(2)),
            RetryDecision::Exhausted
        );
    }

    #[test]
    fn test_bounded_backoff_growth_and_cap() {
        let base = Duration::from_millis(1_000);
        let max = Duration::from_millis(15_000);
        assert_eq!(bounded_backoff(base, max, 0), Duration::from_millis(1_000));
        assert_eq!(bounded_backoff(base, max, 1), Duration::from_millis(2_000));
        assert_eq!(bounded_backoff(base, max, 3), Duration::from_millis(8_000));
        assert_eq!(bounded_backoff(base, max, 6), Duration::from_millis(15_000));
        assert_eq!(bounded_backoff(base, max, 60), Duration::from_millis(15_000));
    }

    #[test]
    fn test_default_policy_matches_production_settings() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.first_delay, Duration::from_secs(2));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
        assert_eq!(policy.retry_timeout, Duration::from_secs(300));
    }
}
