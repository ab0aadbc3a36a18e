use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// What the admission queue does once it holds `highWater` jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Evict the oldest lowest-priority job, then admit.
    #[default]
    Leak,
    /// Reject the new job.
    Overflow,
    /// Evict a strictly lower-priority job if one exists, else reject.
    OverflowPriority,
    /// Clear the queue and reject everything for `penalty`.
    Block,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Strategy::Leak => "leak",
            Strategy::Overflow => "overflow",
            Strategy::OverflowPriority => "overflow-priority",
            Strategy::Block => "block",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueOptions {
    /// Maximum queued jobs. `None` is unbounded.
    pub high_water: Option<usize>,
    pub strategy: Strategy,
    /// Block duration in milliseconds.
    #[serde(rename = "penalty")]
    pub penalty_ms: u64,
    /// Token bucket capacity. `0` disables the bucket.
    pub bucket_size: u32,
    pub tokens_per_interval: u32,
    /// Refill interval in milliseconds.
    #[serde(rename = "interval")]
    pub interval_ms: u64,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            high_water: None,
            strategy: Strategy::Leak,
            penalty_ms: 0,
            bucket_size: 0,
            tokens_per_interval: 1,
            interval_ms: 1000,
        }
    }
}

impl QueueOptions {
    pub fn penalty(&self) -> Duration {
        Duration::from_millis(self.penalty_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn bucket_enabled(&self) -> bool {
        self.bucket_size > 0
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.high_water == Some(0) {
            return Err(ValidationError::new("highWater must be >= 1, got 0"));
        }
        if self.bucket_enabled() {
            if self.tokens_per_interval > self.bucket_size {
                return Err(ValidationError::new(format!(
                    "tokensPerInterval ({}) must not exceed bucketSize ({})",
                    self.tokens_per_interval, self.bucket_size
                )));
            }
            if self.interval_ms == 0 {
                return Err(ValidationError::new(
                    "interval must be > 0 when the token bucket is enabled",
                ));
            }
        }
        if self.strategy == Strategy::Block && self.penalty_ms == 0 {
            return Err(ValidationError::new(
                "penalty must be > 0 with the `block` strategy",
            ));
        }
        Ok(())
    }
}
