//! Bounded retries with capped exponential backoff.
//!
//! [`RetryManager::run_with_retry`] drives an async operation up to
//! `max_retries` times in total. Only errors whose
//! [`FaceError::is_retryable`] is true are retried; anything else (validation,
//! config, protocol, lifecycle) is returned on the spot without consuming the
//! remaining budget. When the budget runs out the last error is wrapped in
//! [`FaceError::RetryExhausted`].
//!
//! Backoff waits use `tokio::time::sleep`, so they suspend only the calling
//! task and can be driven deterministically with paused tokio time. Each wait
//! races the operation's [`CancelToken`]; cancelling it ends the run with
//! [`FaceError::Cancelled`] instead of sleeping out the delay.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::debug;

use crate::api::CancelToken;
use crate::error::{FaceError, Result};

/// Backoff parameters for one operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_retries: u32,
    /// Delay after the first failed attempt.
    #[serde(with = "crate::serde_millis")]
    pub base_delay: Duration,
    /// Cap for any single delay.
    #[serde(with = "crate::serde_millis")]
    pub max_delay: Duration,
    /// Spread delays by ±25 % to avoid synchronized retries.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to wait after failed attempt number `attempt` (1-based):
    /// `min(base_delay * 2^(attempt - 1), max_delay)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);

        if self.jitter {
            let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            let spread = millis / 4;
            if spread > 0 {
                let jittered = millis - spread + fastrand::u64(0..=spread * 2);
                return Duration::from_millis(jittered).min(self.max_delay);
            }
        }

        delay
    }
}

/// Runs operations under a [`RetryPolicy`].
#[derive(Debug, Clone, Copy)]
pub struct RetryManager {
    policy: RetryPolicy,
    logging: bool,
}

impl RetryManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            logging: true,
        }
    }

    /// Toggle the manager's own debug events.
    pub fn with_logging(mut self, enabled: bool) -> Self {
        self.logging = enabled;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute `operation` until it succeeds, fails with a non-retryable
    /// error, or `max_retries` attempts have been made.
    ///
    /// The closure receives the 1-based attempt number. `token` aborts the
    /// backoff wait between attempts; the closure is expected to honor it
    /// for the attempt itself.
    ///
    /// ```
    /// use face_compare::{CancelToken, FaceError, RetryManager, RetryPolicy};
    /// use std::time::Duration;
    ///
    /// # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
    /// let manager = RetryManager::new(
    ///     RetryPolicy::default().with_base_delay(Duration::from_millis(1)),
    /// );
    /// let token = CancelToken::new();
    /// let value = manager
    ///     .run_with_retry("ping", &token, |attempt| async move {
    ///         if attempt < 2 {
    ///             Err(FaceError::Network("connection reset".into()))
    ///         } else {
    ///             Ok(attempt)
    ///         }
    ///     })
    ///     .await
    ///     .unwrap();
    /// assert_eq!(value, 2);
    /// # });
    /// ```
    pub async fn run_with_retry<T, F, Fut>(
        &self,
        label: &str,
        token: &CancelToken,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.policy.max_retries.max(1);
        let mut attempt = 1;

        loop {
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 && self.logging {
                        debug!(label, attempt, "retry_recovered");
                    }
                    return Ok(value);
                }
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) if attempt >= max_attempts => {
                    if self.logging {
                        debug!(label, attempts = attempt, error = %err, "retry_exhausted");
                    }
                    return Err(FaceError::RetryExhausted {
                        label: label.to_string(),
                        attempts: attempt,
                        last_error: Box::new(err),
                    });
                }
                Err(err) => {
                    let delay = self.policy.delay_for(attempt);
                    if self.logging {
                        debug!(
                            label,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "retry_scheduled"
                        );
                    }
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            if self.logging {
                                debug!(label, attempt, "retry_cancelled");
                            }
                            return Err(FaceError::Cancelled);
                        }
                        _ = sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_retries(max_retries)
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5))
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let policy = fast_policy(5);
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn delay_is_capped() {
        let policy = fast_policy(10).with_max_delay(Duration::from_millis(150));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(150));
        assert_eq!(policy.delay_for(40), Duration::from_millis(150));
    }

    #[test]
    fn jitter_stays_within_quarter_band() {
        let policy = fast_policy(3).with_jitter(true);
        for _ in 0..200 {
            let d = policy.delay_for(2);
            assert!(d >= Duration::from_millis(150) && d <= Duration::from_millis(250));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_delays_follow_policy() {
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let manager = RetryManager::new(fast_policy(3));

        let recorded = stamps.clone();
        let result: Result<()> = manager
            .run_with_retry("compare", &CancelToken::new(), move |_| {
                let recorded = recorded.clone();
                async move {
                    recorded.lock().unwrap().push(Instant::now());
                    Err(FaceError::Network("connection refused".into()))
                }
            })
            .await;

        let stamps = stamps.lock().unwrap();
        assert_eq!(stamps.len(), 3);
        let gaps: Vec<Duration> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
        for (gap, expected) in gaps.iter().zip([100u64, 200]) {
            let expected = Duration::from_millis(expected);
            assert!(
                *gap >= expected && *gap < expected + Duration::from_millis(5),
                "gap {gap:?} expected {expected:?}"
            );
        }
        match result {
            Err(FaceError::RetryExhausted {
                label, attempts, ..
            }) => {
                assert_eq!(label, "compare");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn capped_backoff_under_fake_clock() {
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let manager = RetryManager::new(fast_policy(3).with_max_delay(Duration::from_millis(150)));

        let recorded = stamps.clone();
        let _ = manager
            .run_with_retry("compare", &CancelToken::new(), move |_| {
                let recorded = recorded.clone();
                async move {
                    recorded.lock().unwrap().push(Instant::now());
                    Err::<(), _>(FaceError::Timeout(Duration::from_millis(1)))
                }
            })
            .await;

        let stamps = stamps.lock().unwrap();
        let last_gap = stamps[2] - stamps[1];
        assert!(last_gap >= Duration::from_millis(150) && last_gap < Duration::from_millis(155));
    }

    #[tokio::test(start_paused = true)]
    async fn validation_error_is_attempted_once() {
        let calls = Arc::new(Mutex::new(0u32));
        let manager = RetryManager::new(fast_policy(5));

        let counter = calls.clone();
        let result: Result<()> = manager
            .run_with_retry("record", &CancelToken::new(), move |_| {
                let counter = counter.clone();
                async move {
                    *counter.lock().unwrap() += 1;
                    Err(FaceError::Validation("unsupported image format".into()))
                }
            })
            .await;

        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(
            result.unwrap_err(),
            FaceError::Validation("unsupported image format".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let manager = RetryManager::new(fast_policy(3));
        let value = manager
            .run_with_retry("health", &CancelToken::new(), |attempt| async move {
                if attempt < 3 {
                    Err(FaceError::Http {
                        status: 503,
                        status_text: "Service Unavailable".into(),
                    })
                } else {
                    Ok("up")
                }
            })
            .await
            .unwrap();
        assert_eq!(value, "up");
    }

    #[tokio::test(start_paused = true)]
    async fn single_attempt_budget_still_wraps() {
        let manager = RetryManager::new(fast_policy(1));
        let err = manager
            .run_with_retry("compare", &CancelToken::new(), |_| async {
                Err::<(), _>(FaceError::Network("dns failure".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FaceError::RetryExhausted { attempts: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_stops_the_run() {
        let calls = Arc::new(Mutex::new(0u32));
        let manager = RetryManager::new(
            fast_policy(3)
                .with_base_delay(Duration::from_secs(3))
                .with_max_delay(Duration::from_secs(3)),
        );
        let token = CancelToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let counter = calls.clone();
        let result: Result<()> = manager
            .run_with_retry("compare", &token, move |_| {
                let counter = counter.clone();
                async move {
                    *counter.lock().unwrap() += 1;
                    Err(FaceError::Http {
                        status: 500,
                        status_text: "Internal Server Error".into(),
                    })
                }
            })
            .await;

        assert_eq!(result.unwrap_err(), FaceError::Cancelled);
        assert_eq!(*calls.lock().unwrap(), 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn policy_serde_uses_millis() {
        let policy = fast_policy(2);
        let json = serde_json::to_value(policy).unwrap();
        assert_eq!(json["base_delay"], 100);
        let back: RetryPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(back, policy);
    }
}
