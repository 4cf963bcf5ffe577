//! Resilience Patterns
//!
//! Circuit breaker and retry, composed so every outbound call goes through
//! both: the breaker decides whether to attempt at all, the retry policy
//! governs backoff across attempts, and the breaker is updated once with the
//! final outcome of the retried call.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use retry::RetryPolicy;

use crate::error::CfError;

/// Resilience configuration, mirrored by [`crate::config::CfConfig`]'s
/// retry/circuit-breaker knobs.
#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    pub failure_threshold: usize,
    pub reset_timeout_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout_ms: 30_000,
            max_retries: 3,
            retry_delay_ms: 100,
            max_retry_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl ResilienceConfig {
    pub fn circuit_breaker(&self) -> CircuitBreaker {
        CircuitBreaker::new(self.failure_threshold, self.reset_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            self.retry_delay_ms,
            self.max_retry_delay_ms,
            self.backoff_multiplier,
        )
    }
}

/// Runs `operation` through the circuit breaker and retry policy together.
/// Returns [`CfError::State`] without attempting `operation` at all if the
/// breaker is open or mid-probe.
pub async fn execute_with_resilience<F, Fut, T>(
    circuit_breaker: &CircuitBreaker,
    retry_policy: &RetryPolicy,
    operation: F,
) -> Result<T, CfError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, CfError>>,
{
    if !circuit_breaker.is_available().await {
        return Err(CfError::State("circuit breaker is open".to_string()));
    }

    let result = retry_policy.execute(operation).await;

    match &result {
        Ok(_) => circuit_breaker.record_success().await,
        Err(_) => circuit_breaker.record_failure().await,
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_through_breaker_and_retry() {
        let config = ResilienceConfig::default();
        let cb = config.circuit_breaker();
        let retry = config.retry_policy();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result = execute_with_resilience(&cb, &retry, || {
            let calls = calls_clone.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 1 {
                    Err(CfError::Network("transient".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn open_breaker_short_circuits_without_calling_operation() {
        let config = ResilienceConfig {
            failure_threshold: 1,
            reset_timeout_ms: 60_000,
            max_retries: 1,
            ..ResilienceConfig::default()
        };
        let cb = config.circuit_breaker();
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);

        let retry = config.retry_policy();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result: Result<(), CfError> = execute_with_resilience(&cb, &retry, || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
