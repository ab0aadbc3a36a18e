//! Task and limiter states.

use serde::{Deserialize, Serialize};

/// Lifecycle of one retryable task instance.
///
/// State transitions:
/// - Pending -> Running -> Completed
/// - Pending -> Running -> Failed
/// - Pending -> Cancelled (cancelled, cleared or evicted before it ran)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Observable state of a limiter.
///
/// `Stopped` reflects the run flag; the other three are derived from the
/// in-flight count and the queue size while running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LimiterState {
    /// Not pulling new jobs; in-flight jobs still finish.
    Stopped,
    /// Nothing running but jobs are waiting (throttled or blocked).
    Idle,
    /// At least one job in flight.
    Running,
    /// Nothing running, nothing queued.
    Empty,
}

impl LimiterState {
    pub fn derive(running: bool, in_flight: usize, queued: usize) -> Self {
        match (running, in_flight, queued) {
            (false, _, _) => LimiterState::Stopped,
            (true, 0, 0) => LimiterState::Empty,
            (true, 0, _) => LimiterState::Idle,
            (true, _, _) => LimiterState::Running,
        }
    }
}
