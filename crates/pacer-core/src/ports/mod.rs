//! Ports: seams for swapping out side effects.

pub mod metrics;

pub use metrics::{Labels, MetricsSink};
