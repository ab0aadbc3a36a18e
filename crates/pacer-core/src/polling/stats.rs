use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_CYCLES_ON_STATS: usize = 10;

/// Snapshot of a polling manager's cycle history and bucket populations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleStats {
    pub cycles: u64,
    pub overruns: u64,
    pub consecutive_overruns: u64,
    pub last_cycle_duration_ms: u64,
    /// Mean over the rolling window.
    pub average_cycle_duration_ms: f64,
    pub max_cycle_duration_ms: u64,
    pub min_cycle_duration_ms: u64,
    pub pending_tasks: usize,
    pub in_fast_cycle_tasks: usize,
    pub in_slow_cycle_tasks: usize,
    pub in_off_cycle_tasks: usize,
}

impl CycleStats {
    pub fn last_cycle_duration(&self) -> Duration {
        Duration::from_millis(self.last_cycle_duration_ms)
    }
}

/// Rolling record of cycle durations.
#[derive(Debug, Clone)]
pub(crate) struct CycleHistory {
    window: VecDeque<Duration>,
    capacity: usize,
    cycles: u64,
    overruns: u64,
    consecutive_overruns: u64,
    last: Duration,
    max: Duration,
    min: Option<Duration>,
}

impl CycleHistory {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            cycles: 0,
            overruns: 0,
            consecutive_overruns: 0,
            last: Duration::ZERO,
            max: Duration::ZERO,
            min: None,
        }
    }

    pub(crate) fn record(&mut self, duration: Duration, overrun: bool) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(duration);
        self.cycles += 1;
        self.last = duration;
        self.max = self.max.max(duration);
        self.min = Some(self.min.map_or(duration, |min| min.min(duration)));
        if overrun {
            self.overruns += 1;
            self.consecutive_overruns += 1;
        } else {
            self.consecutive_overruns = 0;
        }
    }

    pub(crate) fn snapshot(&self) -> CycleStats {
        let average = if self.window.is_empty() {
            0.0
        } else {
            let total: Duration = self.window.iter().sum();
            total.as_secs_f64() * 1_000.0 / self.window.len() as f64
        };
        CycleStats {
            cycles: self.cycles,
            overruns: self.overruns,
            consecutive_overruns: self.consecutive_overruns,
            last_cycle_duration_ms: self.last.as_millis() as u64,
            average_cycle_duration_ms: average,
            max_cycle_duration_ms: self.max.as_millis() as u64,
            min_cycle_duration_ms: self.min.unwrap_or_default().as_millis() as u64,
            ..CycleStats::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consecutive_overruns_reset_on_timely_cycle() {
        let mut history = CycleHistory::new(3);
        history.record(Duration::from_millis(120), true);
        history.record(Duration::from_millis(130), true);
        assert_eq!(history.snapshot().consecutive_overruns, 2);

        history.record(Duration::from_millis(50), false);
        let stats = history.snapshot();
        assert_eq!(stats.overruns, 2);
        assert_eq!(stats.consecutive_overruns, 0);
        assert_eq!(stats.cycles, 3);
        assert_eq!(stats.min_cycle_duration_ms, 50);
        assert_eq!(stats.max_cycle_duration_ms, 130);
    }

    #[test]
    fn average_uses_rolling_window() {
        let mut history = CycleHistory::new(2);
        for millis in [100, 10, 20] {
            history.record(Duration::from_millis(millis), false);
        }
        let stats = history.snapshot();
        assert!((stats.average_cycle_duration_ms - 15.0).abs() < 1e-9);
        assert_eq!(stats.last_cycle_duration_ms, 20);
        assert_eq!(stats.max_cycle_duration_ms, 100);
    }

    #[test]
    fn empty_history_is_zeroed() {
        assert_eq!(CycleHistory::new(5).snapshot(), CycleStats::default());
    }
}
