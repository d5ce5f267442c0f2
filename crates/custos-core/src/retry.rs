//! Bounded retry with exponential backoff
//!
//! Used only for unclassified failures while gathering evidence or probing
//! health; state-machine errors are never retried.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Retry policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay_ms: u64,
    /// Upper bound on any single delay
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
            max_delay_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retry
    #[inline]
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1` (1-based `attempt`), without jitter
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay_ms.saturating_mul(1 << exp);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent
    ///
    /// # Errors
    /// Returns the last error produced by `op`
    pub async fn run<T, E, F, Fut>(
        &self,
        operation: &str,
        mut op: F,
        retryable: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < attempts && retryable(&err) => {
                    let base = self.delay_for(attempt);
                    let jitter_ms = {
                        let half = u64::try_from(base.as_millis() / 2).unwrap_or(0);
                        rand::rng().random_range(0..=half)
                    };
                    let delay = base + Duration::from_millis(jitter_ms);
                    tracing::debug!(
                        operation,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "retrying after failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if attempt > 1 {
                        tracing::warn!(operation, attempts = attempt, error = %err, "giving up");
                    }
                    return Err(err);
                }
            }
        }
    }
}

/// Run `op` under `policy`
///
/// # Errors
/// Returns the last error produced by `op`
pub async fn with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    op: F,
    retryable: impl Fn(&E) -> bool,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    policy.run(operation, op, retryable).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    proptest! {
        #[test]
        fn delays_are_capped_and_non_decreasing(
            base in 1u64..5_000,
            cap in 1u64..60_000,
            attempt in 1u32..40,
        ) {
            let policy = RetryPolicy { max_attempts: 5, base_delay_ms: base, max_delay_ms: cap };
            prop_assert!(policy.delay_for(attempt) <= Duration::from_millis(cap));
            prop_assert!(policy.delay_for(attempt) <= policy.delay_for(attempt + 1));
        }
    }

    #[test]
    fn delays_grow_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 300,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = &AtomicU32::new(0);
        let result: Result<u32, String> = RetryPolicy::default()
            .run(
                "probe",
                move || async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 { Err(format!("attempt {n}")) } else { Ok(n) }
                },
                |_| true,
            )
            .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_non_retryable_error() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), String> = RetryPolicy::default()
            .run(
                "probe",
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("rejected".to_string())
                },
                |_| false,
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_budget() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), String> = RetryPolicy::default()
            .run(
                "evidence",
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("down".to_string())
                },
                |_| true,
            )
            .await;
        assert_eq!(result.unwrap_err(), "down");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
