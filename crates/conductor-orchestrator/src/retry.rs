use crate::context::ErrorRecord;
use conductor_core::AgentResult;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bounded retry with linear backoff and optional error filtering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts = `max_retries + 1`.
    #[serde(default, alias = "max_retries")]
    pub max_retries: u32,
    /// Base delay; the delay after attempt `n` is `backoff_ms * n`.
    #[serde(default, alias = "backoff_ms")]
    pub backoff_ms: u64,
    /// Only errors containing one of these substrings are retried.
    /// Empty means every error is retryable.
    #[serde(default, alias = "retry_on")]
    pub retry_on: Vec<String>,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_ms: u64) -> Self {
        Self {
            max_retries,
            backoff_ms,
            retry_on: Vec::new(),
        }
    }

    pub fn with_retry_on(mut self, patterns: Vec<String>) -> Self {
        self.retry_on = patterns;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn is_retryable(&self, error: &str) -> bool {
        self.retry_on.is_empty() || self.retry_on.iter().any(|p| error.contains(p.as_str()))
    }

    /// Delay inserted after failed attempt number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

/// Anything an attempt can produce that may represent a failure.
pub trait AttemptOutcome {
    /// The failure text, or `None` when the attempt succeeded.
    fn failure(&self) -> Option<String>;
}

impl<T> AttemptOutcome for Result<T, String> {
    fn failure(&self) -> Option<String> {
        self.as_ref().err().cloned()
    }
}

impl AttemptOutcome for AgentResult {
    fn failure(&self) -> Option<String> {
        if self.success {
            None
        } else {
            Some(
                self.error
                    .clone()
                    .unwrap_or_else(|| "agent reported failure".to_string()),
            )
        }
    }
}

/// What [`run_with_retry`] settled on.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// The last attempt's outcome.
    pub value: T,
    /// Attempts made (at least 1).
    pub attempts: u32,
    /// One record per failed attempt that was retried.
    pub errors: Vec<ErrorRecord>,
}

impl<T> RetryOutcome<T> {
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Run `attempt` until it succeeds, the policy is exhausted, the error is not
/// retryable, or `cancel` fires. `attempt` receives the 1-based attempt number.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    unit: &str,
    cancel: &CancellationToken,
    mut attempt: F,
) -> RetryOutcome<T>
where
    T: AttemptOutcome,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = T>,
{
    let max_attempts = policy.max_attempts();
    let mut errors = Vec::new();
    let mut number = 1;

    loop {
        let value = attempt(number).await;
        let Some(error) = value.failure() else {
            return RetryOutcome {
                value,
                attempts: number,
                errors,
            };
        };

        if number >= max_attempts {
            debug!(unit = %unit, attempts = number, "Retries exhausted");
            return RetryOutcome {
                value,
                attempts: number,
                errors,
            };
        }
        if !policy.is_retryable(&error) {
            debug!(unit = %unit, error = %error, "Error is not retryable");
            return RetryOutcome {
                value,
                attempts: number,
                errors,
            };
        }
        if cancel.is_cancelled() {
            return RetryOutcome {
                value,
                attempts: number,
                errors,
            };
        }

        let delay = policy.backoff_for(number);
        warn!(
            unit = %unit,
            attempt = number,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Attempt failed, retrying"
        );
        errors.push(ErrorRecord::new(unit, error, number));

        if !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return RetryOutcome {
                        value,
                        attempts: number,
                        errors,
                    };
                }
            }
        }

        number += 1;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 1);
        assert!(policy.is_retryable("anything"));
    }

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy::new(3, 100);
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(300));
    }

    #[test]
    fn test_retry_on_filter() {
        let policy = RetryPolicy::new(2, 0).with_retry_on(vec!["timeout".into(), "503".into()]);
        assert!(policy.is_retryable("upstream returned 503"));
        assert!(!policy.is_retryable("invalid argument"));
    }

    #[test]
    fn test_policy_deserializes_both_casings() {
        let camel: RetryPolicy =
            serde_json::from_str(r#"{"maxRetries": 2, "backoffMs": 10, "retryOn": ["x"]}"#).unwrap();
        let snake: RetryPolicy =
            serde_json::from_str(r#"{"max_retries": 2, "backoff_ms": 10, "retry_on": ["x"]}"#)
                .unwrap();
        assert_eq!(camel, snake);
    }

    #[tokio::test]
    async fn test_always_failing_makes_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::new(2, 0);
        let outcome = run_with_retry(&policy, "s", &CancellationToken::new(), move |_| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), String>("boom".into())
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.retries(), 2);
        assert_eq!(outcome.errors.len(), 2);
        assert_eq!(outcome.errors[0].retry_attempt, 1);
        assert!(outcome.value.is_err());
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failure() {
        let policy = RetryPolicy::new(3, 0);
        let outcome = run_with_retry(&policy, "s", &CancellationToken::new(), |n| async move {
            if n < 2 {
                Err("flaky".to_string())
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(outcome.value, Ok(2));
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let policy = RetryPolicy::new(5, 0).with_retry_on(vec!["timeout".into()]);
        let outcome = run_with_retry(&policy, "s", &CancellationToken::new(), |_| async {
            Err::<(), String>("permission denied".into())
        })
        .await;
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.errors.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_stops_retrying() {
        let token = CancellationToken::new();
        let policy = RetryPolicy::new(5, 60_000);
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let outcome = run_with_retry(&policy, "s", &token, |_| async {
            Err::<(), String>("boom".into())
        })
        .await;
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.errors.len(), 1);
    }

    #[test]
    fn test_agent_result_outcome() {
        assert!(AgentResult::success("ok").failure().is_none());
        assert_eq!(
            AgentResult::failure("nope").failure().as_deref(),
            Some("nope")
        );
    }
}
