//! MetricsSink implementations.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::ports::{Labels, MetricsSink};
use crate::sync::lock;

/// Discards every sample.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _name: &str, _labels: Labels<'_>, _value: u64) {}

    fn gauge(&self, _name: &str, _labels: Labels<'_>, _value: f64) {}

    fn observe(&self, _name: &str, _labels: Labels<'_>, _value: f64) {}
}

/// Keeps every sample in memory, keyed by `name{label=value,...}` with
/// labels sorted by key. Meant for tests and the CLI summary.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<String, u64>>,
    gauges: Mutex<HashMap<String, f64>>,
    histograms: Mutex<HashMap<String, Vec<f64>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, key: &str) -> u64 {
        lock(&self.counters).get(key).copied().unwrap_or_default()
    }

    pub fn gauge_value(&self, key: &str) -> Option<f64> {
        lock(&self.gauges).get(key).copied()
    }

    pub fn observations(&self, key: &str) -> Vec<f64> {
        lock(&self.histograms).get(key).cloned().unwrap_or_default()
    }

    /// Sum of a counter across every label set.
    pub fn counter_total(&self, name: &str) -> u64 {
        lock(&self.counters)
            .iter()
            .filter(|(key, _)| metric_name(key) == name)
            .map(|(_, value)| value)
            .sum()
    }

    /// Sorted view of every counter and gauge.
    pub fn render(&self) -> BTreeMap<String, f64> {
        let mut out: BTreeMap<String, f64> = lock(&self.counters)
            .iter()
            .map(|(key, value)| (key.clone(), *value as f64))
            .collect();
        out.extend(lock(&self.gauges).iter().map(|(key, value)| (key.clone(), *value)));
        out
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment(&self, name: &str, labels: Labels<'_>, value: u64) {
        *lock(&self.counters).entry(metric_key(name, labels)).or_default() += value;
    }

    fn gauge(&self, name: &str, labels: Labels<'_>, value: f64) {
        lock(&self.gauges).insert(metric_key(name, labels), value);
    }

    fn observe(&self, name: &str, labels: Labels<'_>, value: f64) {
        lock(&self.histograms)
            .entry(metric_key(name, labels))
            .or_default()
            .push(value);
    }
}

pub fn metric_key(name: &str, labels: Labels<'_>) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut sorted = labels.to_vec();
    sorted.sort_unstable_by_key(|(key, _)| *key);
    let rendered = sorted
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",");
    format!("{name}{{{rendered}}}")
}

fn metric_name(key: &str) -> &str {
    key.split('{').next().unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_sorts_labels() {
        let key = metric_key("m", &[("resource", "db"), ("group", "5s")]);
        assert_eq!(key, "m{group=5s,resource=db}");
        assert_eq!(metric_key("m", &[]), "m");
    }

    #[test]
    fn counters_accumulate() {
        let metrics = InMemoryMetrics::new();
        metrics.increment("hits", &[("resource", "a")], 1);
        metrics.increment("hits", &[("resource", "a")], 2);
        metrics.increment("hits", &[("resource", "b")], 4);

        assert_eq!(metrics.counter("hits{resource=a}"), 3);
        assert_eq!(metrics.counter_total("hits"), 7);
    }

    #[test]
    fn gauges_keep_last_value_and_histograms_keep_all() {
        let metrics = InMemoryMetrics::new();
        metrics.gauge("pending", &[], 3.0);
        metrics.gauge("pending", &[], 1.0);
        metrics.observe("duration", &[], 10.0);
        metrics.observe("duration", &[], 20.0);

        assert_eq!(metrics.gauge_value("pending"), Some(1.0));
        assert_eq!(metrics.observations("duration"), vec![10.0, 20.0]);
        assert_eq!(metrics.render().get("pending"), Some(&1.0));
    }
}
