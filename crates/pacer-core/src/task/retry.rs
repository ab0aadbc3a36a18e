//! Retry policy and the `with_retry` combinator.
//!
//! 待ち時間は `waitTime * 2^(attempt-1)` で増え、`maxWaitTime` で頭打ちになります。
//! 各 attempt は `timeout` と競争させ、handler の panic は `Execution` エラーとして扱います。

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::handler::{TaskHandler, TaskOutput};
use crate::domain::TaskError;
use crate::error::ValidationError;

/// How often, how long and how patiently a task is attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Total attempts, at least 1.
    pub attempts: u32,
    /// Per-attempt timeout in milliseconds.
    #[serde(rename = "timeout", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Delay before the first retry, in milliseconds. Doubles each retry.
    #[serde(rename = "waitTime")]
    pub wait_time_ms: u64,
    /// Upper bound for the retry delay, in milliseconds.
    #[serde(rename = "maxWaitTime")]
    pub max_wait_time_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 1,
            timeout_ms: None,
            wait_time_ms: 1000,
            max_wait_time_ms: 15000,
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_wait(mut self, wait_time: Duration, max_wait_time: Duration) -> Self {
        self.wait_time_ms = wait_time.as_millis() as u64;
        self.max_wait_time_ms = max_wait_time.as_millis() as u64;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn wait_time(&self) -> Duration {
        Duration::from_millis(self.wait_time_ms)
    }

    pub fn max_wait_time(&self) -> Duration {
        Duration::from_millis(self.max_wait_time_ms)
    }

    /// Delay after the `attempt`-th failure (1-indexed):
    /// `wait_time * 2^(attempt - 1)`, capped at `max_wait_time`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.wait_time_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_wait_time_ms))
    }

    /// This policy with every budget capped by `ceiling`: fewer attempts,
    /// shorter timeout and shorter waits win.
    pub fn bounded_by(&self, ceiling: &RetryPolicy) -> RetryPolicy {
        let timeout_ms = match (self.timeout_ms, ceiling.timeout_ms) {
            (Some(own), Some(cap)) => Some(own.min(cap)),
            (own, cap) => own.or(cap),
        };
        let wait_time_ms = self.wait_time_ms.min(ceiling.wait_time_ms);
        RetryPolicy {
            attempts: self.attempts.min(ceiling.attempts).max(1),
            timeout_ms,
            wait_time_ms,
            max_wait_time_ms: self.max_wait_time_ms.min(ceiling.max_wait_time_ms).max(wait_time_ms),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.attempts == 0 {
            return Err(ValidationError::new("retry attempts must be >= 1, got 0"));
        }
        if self.timeout_ms == Some(0) {
            return Err(ValidationError::new("retry timeout must be > 0"));
        }
        Ok(())
    }
}

/// A handler wrapped with a retry policy.
///
/// Each attempt is raced against the policy timeout. The cancellation token
/// is checked before every attempt and interrupts the wait between attempts;
/// an attempt already running is never interrupted.
pub struct Retrying {
    inner: Arc<dyn TaskHandler>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

/// Wrap `handler` so failures are retried under `policy`.
pub fn with_retry(handler: Arc<dyn TaskHandler>, policy: RetryPolicy) -> Retrying {
    Retrying {
        inner: handler,
        policy,
        cancel: CancellationToken::new(),
    }
}

impl Retrying {
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn attempt(&self, args: Vec<Value>) -> TaskOutput {
        let call = AssertUnwindSafe(self.inner.handle(args)).catch_unwind();
        let outcome = match self.policy.timeout() {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => return Err(TaskError::timeout(limit)),
            },
            None => call.await,
        };
        outcome.unwrap_or_else(|panic| Err(TaskError::execution(panic_message(panic.as_ref()))))
    }
}

#[async_trait]
impl TaskHandler for Retrying {
    async fn handle(&self, args: Vec<Value>) -> TaskOutput {
        let attempts = self.policy.attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            if self.cancel.is_cancelled() {
                return Err(TaskError::cancelled(
                    "the task was cancelled before the attempt started",
                ));
            }

            let err = match self.attempt(args.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if attempt >= attempts {
                return Err(TaskError::retry_exhausted(attempts, err));
            }

            let delay = self.policy.next_delay(attempt);
            debug!(attempt, attempts, delay_ms = delay.as_millis() as u64, error = %err, "attempt failed, retrying");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => {
                    return Err(TaskError::cancelled("the task was cancelled between attempts"));
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("the task panicked: {detail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn failing_times(failures: u32) -> (Arc<dyn TaskHandler>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let handler: Arc<dyn TaskHandler> = Arc::new(move |_args: Vec<Value>| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < failures {
                    Err(TaskError::execution(format!("failure {n}")))
                } else {
                    Ok(Value::from(n))
                }
            }
        });
        (handler, calls)
    }

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts).with_wait(Duration::from_millis(5), Duration::from_millis(20))
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy::new(5).with_wait(Duration::from_secs(1), Duration::from_secs(5));

        assert_eq!(policy.next_delay(1), Duration::from_secs(1));
        assert_eq!(policy.next_delay(2), Duration::from_secs(2));
        assert_eq!(policy.next_delay(3), Duration::from_secs(4));
        assert_eq!(policy.next_delay(4), Duration::from_secs(5));
        assert_eq!(policy.next_delay(40), Duration::from_secs(5));
    }

    #[test]
    fn bounded_policy_never_exceeds_ceiling() {
        let own = RetryPolicy::new(6).with_wait(Duration::from_millis(500), Duration::from_secs(5));
        let ceiling = RetryPolicy::new(1)
            .with_timeout(Duration::from_millis(200))
            .with_wait(Duration::from_millis(10), Duration::from_millis(10));

        let bounded = own.bounded_by(&ceiling);
        assert_eq!(bounded.attempts, 1);
        assert_eq!(bounded.timeout(), Some(Duration::from_millis(200)));
        assert_eq!(bounded.wait_time(), Duration::from_millis(10));
        assert_eq!(bounded.max_wait_time(), Duration::from_millis(10));

        let tighter = RetryPolicy::new(2).with_timeout(Duration::from_millis(50));
        let bounded = tighter.bounded_by(&RetryPolicy::new(3).with_timeout(Duration::from_millis(200)));
        assert_eq!(bounded.attempts, 2);
        assert_eq!(bounded.timeout(), Some(Duration::from_millis(50)));
    }

    #[test]
    fn zero_attempts_is_invalid() {
        assert!(RetryPolicy::new(0).validate().is_err());
        assert!(RetryPolicy::default().validate().is_ok());
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let (handler, calls) = failing_times(2);
        let out = with_retry(handler, fast(3)).handle(vec![]).await;

        assert_eq!(out.unwrap(), Value::from(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_error_wraps_last_failure() {
        let (handler, calls) = failing_times(u32::MAX);
        let err = with_retry(handler, fast(3)).handle(vec![]).await.unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.kind(), ErrorKind::RetryExhausted);
        assert_eq!(err.causes()[0].message(), "failure 2");
    }

    #[tokio::test]
    async fn timeout_counts_as_failed_attempt() {
        let slow: Arc<dyn TaskHandler> = Arc::new(|_args: Vec<Value>| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, TaskError>(Value::Null)
        });
        let policy = fast(2).with_timeout(Duration::from_millis(10));

        let err = with_retry(slow, policy).handle(vec![]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RetryExhausted);
        assert_eq!(err.causes()[0].kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn cancellation_stops_before_next_attempt() {
        let (handler, calls) = failing_times(u32::MAX);
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::new(10).with_wait(Duration::from_millis(50), Duration::from_millis(50));
        let retrying = with_retry(handler, policy).with_cancel(cancel.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let err = retrying.handle(vec![]).await.unwrap_err();
        canceller.await.unwrap();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panic_becomes_execution_error() {
        let panicking: Arc<dyn TaskHandler> = Arc::new(|_args: Vec<Value>| async {
            if true {
                panic!("handler exploded");
            }
            Ok::<_, TaskError>(Value::Null)
        });

        let err = with_retry(panicking, RetryPolicy::new(1)).handle(vec![]).await.unwrap_err();
        let cause = &err.causes()[0];
        assert_eq!(cause.kind(), ErrorKind::Execution);
        assert!(cause.message().contains("handler exploded"));
    }
}
