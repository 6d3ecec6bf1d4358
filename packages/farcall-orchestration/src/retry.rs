//! Retry and polling policies
//!
//! Both are plain config values injected into the job driver; no call site
//! loops on its own.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::adapters::AdapterError;

/// Bounded exponential backoff for stage / submit / poll / fetch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    4
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

/// Last error of a retried operation and how many attempts were made
#[derive(Debug)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last: AdapterError,
}

impl std::fmt::Display for RetryExhausted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (after {} attempt(s))", self.last, self.attempts)
    }
}

fn backoff(initial_ms: u64, max_ms: u64, multiplier: f64, step: u32) -> Duration {
    let scaled = initial_ms as f64 * multiplier.powi(step.min(32) as i32);
    Duration::from_millis(scaled.min(max_ms as f64) as u64)
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: initial_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
            multiplier: default_multiplier(),
        }
    }

    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0 = first retry)
    pub fn delay(&self, retry: u32) -> Duration {
        backoff(self.initial_delay_ms, self.max_delay_ms, self.multiplier, retry)
    }

    /// Run `op` until it succeeds, fails permanently, or the attempt budget
    /// is spent. Only `Transient` errors are retried.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, RetryExhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AdapterError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.category().is_retryable() && attempt < max_attempts => {
                    let delay = self.delay(attempt - 1);
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        operation, attempt, max_attempts, delay, err
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(last) => {
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last,
                    })
                }
            }
        }
    }
}

/// Poll scheduling for one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollPolicy {
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
    #[serde(default = "default_poll_multiplier")]
    pub multiplier: f64,
    /// Consecutive unrecognised status tokens tolerated before tracking stops
    #[serde(default = "default_unknown_budget")]
    pub unknown_budget: u32,
}

fn default_initial_interval_ms() -> u64 {
    1_000
}

fn default_max_interval_ms() -> u64 {
    30_000
}

fn default_poll_multiplier() -> f64 {
    1.5
}

fn default_unknown_budget() -> u32 {
    5
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            multiplier: default_poll_multiplier(),
            unknown_budget: default_unknown_budget(),
        }
    }
}

impl PollPolicy {
    /// Wait before poll number `poll` (0 = first poll after submission)
    pub fn interval(&self, poll: u32) -> Duration {
        backoff(
            self.initial_interval_ms,
            self.max_interval_ms,
            self.multiplier,
            poll,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(350));
        assert_eq!(policy.delay(30), Duration::from_millis(350));
    }

    #[test]
    fn test_poll_interval_grows() {
        let policy = PollPolicy {
            initial_interval_ms: 1000,
            max_interval_ms: 2000,
            multiplier: 1.5,
            unknown_budget: 3,
        };
        assert_eq!(policy.interval(0), Duration::from_millis(1000));
        assert_eq!(policy.interval(1), Duration::from_millis(1500));
        assert_eq!(policy.interval(2), Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let value = policy
            .run("fetch", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(AdapterError::ResultMissing("not yet".to_string()))
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let err = RetryPolicy::default()
            .run("submit", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(AdapterError::Parse {
                    operation: "submit",
                    output: "garbage".to_string(),
                })
            })
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_is_bounded() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(10));
        let err = policy
            .run("poll", || async {
                Err::<(), _>(AdapterError::ResultMissing("down".to_string()))
            })
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 3);
    }
}
