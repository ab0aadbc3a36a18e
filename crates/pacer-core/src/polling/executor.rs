use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use super::manager::PollingManager;

/// Drives one polling manager: run a cycle, sleep for the rest of the
/// period, repeat.
///
/// Dropping the executor (or calling `stop`) ends the loop at the next
/// await point. Tasks already submitted to the limiter finish normally.
pub struct PollingExecutor {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl PollingExecutor {
    pub fn spawn(manager: PollingManager) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(executor_loop(manager, shutdown_rx));
        Self { shutdown_tx, join }
    }

    /// Pause after a cycle that took `last`: the rest of the period, or
    /// nothing when the cycle overran.
    pub fn next_delay(period: Duration, last: Duration) -> Duration {
        period.saturating_sub(last)
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn stop_and_join(self) {
        self.stop();
        let _ = self.join.await;
    }
}

async fn executor_loop(manager: PollingManager, mut shutdown_rx: watch::Receiver<bool>) {
    let period = manager.group().period();
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let stats = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            stats = manager.run_cycle() => stats,
        };

        let delay = PollingExecutor::next_delay(period, stats.last_cycle_duration());
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
    debug!(resource = %manager.resource(), group = %manager.group(), "polling executor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_fills_the_rest_of_the_period() {
        let period = Duration::from_millis(100);
        assert_eq!(
            PollingExecutor::next_delay(period, Duration::from_millis(30)),
            Duration::from_millis(70)
        );
        assert_eq!(
            PollingExecutor::next_delay(period, Duration::from_millis(150)),
            Duration::ZERO
        );
    }
}
