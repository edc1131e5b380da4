//! Bounded retry with exponential backoff and random jitter.
//!
//! The policy is a plain value handed to whoever makes the external call,
//! so tests can swap in a zero-delay policy.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::error::AiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Never below 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_jitter: Duration::from_millis(250),
        }
    }
}

/// All attempts failed (or the error was not retryable).
#[derive(Debug, Clone, Error)]
#[error("gave up after {attempts} attempt(s): {last}")]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last: AiError,
}

impl RetryPolicy {
    /// `max_attempts` tries with no waiting in between.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_jitter: Duration::ZERO,
        }
    }

    /// Backoff before retry number `retry` (1-based): `base * 2^(retry-1)`, without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp)
    }

    /// `backoff(retry)` plus uniform jitter in `[0, max_jitter]`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        };
        self.backoff(retry) + jitter
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or attempts run out.
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, RetryExhausted>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AiError>>,
    {
        let max = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) if !e.is_retryable() || attempt >= max => {
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    tracing::debug!(
                        target: "retry",
                        what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles() {
        let p = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_jitter: Duration::ZERO,
        };
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(400));
        assert_eq!(p.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn jitter_stays_bounded() {
        let p = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_jitter: Duration::from_millis(5),
        };
        for _ in 0..50 {
            let d = p.delay_for(1);
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(15));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let out = RetryPolicy::default()
            .run("test", |n| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(AiError::Timeout)
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let err = RetryPolicy::immediate(3)
            .run("test", |_| async { Err::<(), _>(AiError::RateLimited) })
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 3);
        assert!(matches!(err.last, AiError::RateLimited));
    }

    #[tokio::test]
    async fn disabled_is_not_retried() {
        let err = RetryPolicy::immediate(3)
            .run("test", |_| async { Err::<(), _>(AiError::Disabled) })
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 1);
    }
}
