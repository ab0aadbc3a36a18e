use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::queue::QueueOptions;
use crate::task::RetryPolicy;

/// Concurrency value meaning "no limit".
pub const UNBOUNDED: usize = usize::MAX;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LimiterOptions {
    /// Maximum tasks in flight. [`UNBOUNDED`] removes the limit.
    pub concurrency: usize,
    /// Minimum pause between consecutive task starts, in milliseconds.
    #[serde(rename = "delay")]
    pub delay_ms: u64,
    pub auto_start: bool,
    /// Applied to tasks that carry no retry policy of their own.
    pub retry_options: RetryPolicy,
    #[serde(flatten)]
    pub queue: QueueOptions,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            delay_ms: 0,
            auto_start: true,
            retry_options: RetryPolicy::default(),
            queue: QueueOptions::default(),
        }
    }
}

impl LimiterOptions {
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Self::default()
        }
    }

    pub fn unbounded() -> Self {
        Self::with_concurrency(UNBOUNDED)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.concurrency == 0 {
            return Err(ValidationError::new("concurrency must be >= 1, got 0"));
        }
        self.retry_options.validate()?;
        self.queue.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Strategy;

    #[test]
    fn zero_concurrency_is_invalid() {
        let err = LimiterOptions::with_concurrency(0).validate().unwrap_err();
        assert!(err.message().contains("concurrency"));
    }

    #[test]
    fn queue_options_are_flattened() {
        let options: LimiterOptions = serde_json::from_value(serde_json::json!({
            "concurrency": 4,
            "delay": 25,
            "highWater": 10,
            "strategy": "overflow",
            "retryOptions": { "attempts": 3 }
        }))
        .unwrap();

        assert_eq!(options.concurrency, 4);
        assert_eq!(options.delay(), Duration::from_millis(25));
        assert_eq!(options.queue.high_water, Some(10));
        assert_eq!(options.queue.strategy, Strategy::Overflow);
        assert_eq!(options.retry_options.attempts, 3);
        assert!(options.auto_start);
    }

    #[test]
    fn invalid_queue_options_fail_limiter_validation() {
        let mut options = LimiterOptions::default();
        options.queue.high_water = Some(0);
        assert!(options.validate().is_err());
    }
}
