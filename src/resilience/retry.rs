//! Retry Policy Implementation
//!
//! Configurable retry logic with exponential backoff and jitter.

use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry policy configuration.
///
/// Generalized from the teacher's `RetryPolicy` (which hardcoded a 30s max
/// delay and no jitter) to the spec'd `(max_attempts, initial_delay_ms,
/// max_delay_ms, backoff_multiplier)` knobs plus uniform jitter in
/// `[0.5*delay, 1.5*delay)`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, initial_delay_ms: u64, max_delay_ms: u64, multiplier: f64) -> Self {
        assert!(multiplier >= 1.0, "backoff multiplier must be >= 1");
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(initial_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms),
            multiplier,
        }
    }

    /// Delay for attempt `k` (1-indexed) before jitter: `min(initial * m^(k-1), max)`.
    fn base_delay(&self, attempt: usize) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi((attempt - 1) as i32);
        Duration::from_secs_f64(scaled).min(self.max_delay)
    }

    /// Applies uniform jitter in `[0.5*delay, 1.5*delay)`.
    fn jittered_delay(&self, attempt: usize) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let factor = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(base * factor)
    }

    /// Executes `operation` with retry. Cancellation of the awaiting task
    /// during a backoff sleep aborts retries and propagates cancellation,
    /// since `tokio::time::sleep` is itself cancel-safe.
    pub async fn execute<F, Fut, T, E>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempts = 0;

        loop {
            attempts += 1;

            match operation().await {
                Ok(result) => {
                    if attempts > 1 {
                        debug!(attempts, "operation succeeded after retry");
                    }
                    return Ok(result);
                }
                Err(err) => {
                    if attempts >= self.max_attempts {
                        warn!(attempts, %err, "operation failed after exhausting retries");
                        return Err(err);
                    }

                    let delay = self.jittered_delay(attempts);
                    warn!(
                        attempt = attempts,
                        max_attempts = self.max_attempts,
                        %err,
                        ?delay,
                        "operation failed, retrying"
                    );

                    sleep(delay).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 100, 30_000, 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(5, 1, 100, 2.0);
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let result: Result<&str, &str> = policy
            .execute(|| {
                let counter = counter_clone.clone();
                async move {
                    let count = counter.fetch_add(1, Ordering::SeqCst);
                    if count < 2 {
                        Err("temporary failure")
                    } else {
                        Ok("success")
                    }
                }
            })
            .await;

        assert_eq!(result, Ok("success"));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let policy = RetryPolicy::new(3, 1, 10, 2.0);
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<(), &str> = policy
            .execute(|| {
                let attempts = attempts_clone.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err("always fails")
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn base_delay_is_bounded_by_max() {
        let policy = RetryPolicy::new(10, 100, 1000, 2.0);
        // 100 * 2^9 would be far beyond max_delay without the cap.
        assert_eq!(policy.base_delay(10), Duration::from_millis(1000));
    }

    #[test]
    fn base_delay_follows_exponential_schedule() {
        let policy = RetryPolicy::new(10, 100, 100_000, 2.0);
        assert_eq!(policy.base_delay(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay(3), Duration::from_millis(400));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Invariant 5: delay_k ∈ [0.5·min(initial·m^(k-1), max), 1.5·min(initial·m^(k-1), max))
        #[test]
        fn jittered_delay_stays_within_bounds(
            initial_ms in 1u64..2000,
            max_ms in 1u64..60_000,
            multiplier in 1.0f64..4.0,
            attempt in 1usize..8,
        ) {
            let policy = RetryPolicy::new(10, initial_ms, max_ms, multiplier);
            let base = policy.base_delay(attempt).as_secs_f64();
            for _ in 0..20 {
                let delay = policy.jittered_delay(attempt).as_secs_f64();
                prop_assert!(delay >= base * 0.5 - 1e-9);
                prop_assert!(delay < base * 1.5 + 1e-9);
            }
        }
    }
}
