//! Token bucket gating how many weighted jobs may start per interval.

use std::time::Duration;

/// Capacity-limited token counter refilled at a fixed interval.
///
/// A capacity of zero disables the bucket: every take succeeds.
/// Invariant: `0 <= level <= capacity`.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: u32,
    level: u32,
    tokens_per_interval: u32,
    interval: Duration,
}

impl TokenBucket {
    /// The bucket starts full.
    pub fn new(capacity: u32, tokens_per_interval: u32, interval: Duration) -> Self {
        Self {
            capacity,
            level: capacity,
            tokens_per_interval,
            interval,
        }
    }

    pub fn disabled() -> Self {
        Self::new(0, 0, Duration::ZERO)
    }

    pub fn enabled(&self) -> bool {
        self.capacity > 0
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Add one interval worth of tokens. Returns whether the level changed.
    pub fn refill(&mut self) -> bool {
        if !self.enabled() {
            return false;
        }
        let next = self
            .level
            .saturating_add(self.tokens_per_interval)
            .min(self.capacity);
        let changed = next != self.level;
        self.level = next;
        changed
    }

    pub fn can_take(&self, weight: u32) -> bool {
        !self.enabled() || self.level >= weight
    }

    /// Consume `weight` tokens if available.
    pub fn try_take(&mut self, weight: u32) -> bool {
        if !self.enabled() {
            return true;
        }
        if self.level < weight {
            return false;
        }
        self.level -= weight;
        true
    }
}
