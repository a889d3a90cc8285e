//! Exponential-backoff retry shared by every outbound gateway/backend call.

use std::future::Future;
use std::time::Duration;

/// Backoff shape for one call site. Call sites tune the limits; the growth
/// math is shared so every outbound call behaves the same way.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts = max_retries + 1.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub growth_factor: f64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            growth_factor: 2.0,
        }
    }

    pub fn with_growth_factor(mut self, growth_factor: f64) -> Self {
        self.growth_factor = growth_factor;
        self
    }

    /// Delay before retry number `attempt` (0-based), with `jitter_unit`
    /// in `[0, 1)` supplied by the caller so the growth/cap behavior stays
    /// a pure function of its inputs.
    pub fn next_delay(&self, attempt: u32, jitter_unit: f64) -> Duration {
        let base = self.base_delay.as_millis() as f64;
        let grown = base * self.growth_factor.powi(attempt as i32);
        let jitter = jitter_unit.clamp(0.0, 1.0) * base;
        let capped = (grown + jitter).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(10),
            growth_factor: 2.0,
        }
    }
}

/// Run `op` until it succeeds or the policy is exhausted, sleeping the
/// policy delay between attempts. The last error is returned as-is.
pub async fn retry<T, E, F, Fut>(policy: RetryPolicy, op: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_if(policy, |_: &E| true, op).await
}

/// Like [`retry`], but stops immediately when `is_retryable` rejects the
/// error, so contract errors are not hammered against the backend.
pub async fn retry_if<T, E, P, F, Fut>(policy: RetryPolicy, is_retryable: P, op: F) -> Result<T, E>
where
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(attempt, "retry succeeded");
                }
                return Ok(value);
            }
            Err(e) if attempt < policy.max_retries && is_retryable(&e) => {
                let delay = policy.next_delay(attempt, rand::random::<f64>());
                tracing::warn!(
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "operation failed, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_retries,
            Duration::from_millis(1),
            Duration::from_millis(10),
        )
    }

    #[test]
    fn next_delay_grows_exponentially() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_secs(60));
        assert_eq!(policy.next_delay(0, 0.0), Duration::from_millis(100));
        assert_eq!(policy.next_delay(1, 0.0), Duration::from_millis(200));
        assert_eq!(policy.next_delay(2, 0.0), Duration::from_millis(400));
    }

    #[test]
    fn next_delay_never_exceeds_max() {
        let policy = RetryPolicy::new(10, Duration::from_millis(500), Duration::from_secs(5));
        for attempt in 0..10 {
            assert!(policy.next_delay(attempt, 0.999) <= Duration::from_secs(5));
        }
    }

    #[test]
    fn jitter_adds_at_most_one_base_delay() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(60));
        let without = policy.next_delay(1, 0.0);
        let with = policy.next_delay(1, 0.5);
        assert_eq!(with - without, Duration::from_millis(50));
    }

    #[tokio::test]
    async fn retry_bound_is_max_retries_plus_one() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let result: Result<(), String> = retry(fast_policy(3), move || {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Err("always fails".to_string())
            }
        })
        .await;
        assert_eq!(result.unwrap_err(), "always fails");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let result: Result<u32, String> = retry(fast_policy(5), move || {
            let counted = counted.clone();
            async move {
                let n = counted.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_if_stops_on_non_retryable() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let result: Result<(), String> = retry_if(
            fast_policy(5),
            |e: &String| e.contains("transient"),
            move || {
                let counted = counted.clone();
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Err("bad request".to_string())
                }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
