use std::time::Duration;

use crate::task::RetryPolicy;

/// Most attempts a fast-cycle task gets.
pub const MAX_FAST_ATTEMPTS: u32 = 3;

/// Hard ceiling on any per-attempt timeout.
pub const DEFAULT_MAX_TIMEOUT: Duration = Duration::from_millis(15_000);

/// Derives the effective retry policy of a polling entry from the user's.
///
/// Fast-cycle tasks get a few attempts, bounded so a full retry run fits the
/// cycle period. Slow-cycle tasks get a single attempt.
#[derive(Debug, Clone)]
pub struct RetryManager {
    period: Duration,
    limiter_delay: Duration,
    max_timeout: Duration,
}

impl RetryManager {
    pub fn new(period: Duration, limiter_delay: Duration, max_timeout: Duration) -> Self {
        Self {
            period,
            limiter_delay,
            max_timeout,
        }
    }

    pub fn fast(&self, user: &RetryPolicy) -> RetryPolicy {
        self.bounded(user, user.attempts.clamp(1, MAX_FAST_ATTEMPTS))
    }

    pub fn slow(&self, user: &RetryPolicy) -> RetryPolicy {
        self.bounded(user, 1)
    }

    fn bounded(&self, user: &RetryPolicy, attempts: u32) -> RetryPolicy {
        let budget = self.period.saturating_mul(attempts).min(self.max_timeout);
        let timeout = user.timeout().map_or(budget, |timeout| timeout.min(budget));
        let wait_time = user.wait_time().min(self.limiter_delay);
        let max_wait_time = user.max_wait_time().min(self.limiter_delay).max(wait_time);

        RetryPolicy::new(attempts)
            .with_timeout(timeout)
            .with_wait(wait_time, max_wait_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn manager(period_ms: u64, delay_ms: u64) -> RetryManager {
        RetryManager::new(
            Duration::from_millis(period_ms),
            Duration::from_millis(delay_ms),
            DEFAULT_MAX_TIMEOUT,
        )
    }

    #[rstest]
    #[case(1, 1)]
    #[case(3, 3)]
    #[case(10, 3)]
    fn fast_attempts_are_capped(#[case] user: u32, #[case] expected: u32) {
        let policy = manager(1_000, 100).fast(&RetryPolicy::new(user));
        assert_eq!(policy.attempts, expected);
    }

    #[test]
    fn slow_is_single_attempt() {
        let policy = manager(1_000, 100).slow(&RetryPolicy::new(5));
        assert_eq!(policy.attempts, 1);
        assert_eq!(policy.timeout(), Some(Duration::from_millis(1_000)));
    }

    #[test]
    fn timeout_is_min_of_user_period_and_ceiling() {
        let rm = manager(2_000, 100);
        let user = RetryPolicy::new(3);
        assert_eq!(rm.fast(&user).timeout(), Some(Duration::from_millis(6_000)));

        let tight = RetryPolicy::new(3).with_timeout(Duration::from_millis(500));
        assert_eq!(rm.fast(&tight).timeout(), Some(Duration::from_millis(500)));

        let slow_cadence = manager(60_000, 100);
        assert_eq!(slow_cadence.fast(&user).timeout(), Some(DEFAULT_MAX_TIMEOUT));
    }

    #[test]
    fn wait_is_capped_by_limiter_delay() {
        let user = RetryPolicy::new(3).with_wait(Duration::from_secs(1), Duration::from_secs(10));
        let policy = manager(1_000, 250).fast(&user);
        assert_eq!(policy.wait_time(), Duration::from_millis(250));
        assert_eq!(policy.max_wait_time(), Duration::from_millis(250));

        let no_delay = manager(1_000, 0).fast(&user);
        assert_eq!(no_delay.wait_time(), Duration::ZERO);
    }
}
