//! MetricsSink port: where polling cycles report their numbers.
//!
//! Metric names emitted by the polling layer:
//! - `polling_cycles_total` (counter)
//! - `polling_overruns_total` (counter)
//! - `polling_task_errors_total` (counter)
//! - `polling_task_duration_ms` (histogram)
//! - `polling_pending_tasks`, `polling_fast_tasks`, `polling_slow_tasks`,
//!   `polling_off_tasks` (gauges)
//!
//! Every sample carries `resource` and `group` labels; task metrics add `task`.

pub type Labels<'a> = &'a [(&'a str, &'a str)];

/// Sink for counters, gauges and histogram observations.
///
/// Calls happen on the hot path and must not block.
pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &str, labels: Labels<'_>, value: u64);

    fn gauge(&self, name: &str, labels: Labels<'_>, value: f64);

    fn observe(&self, name: &str, labels: Labels<'_>, value: f64);
}
