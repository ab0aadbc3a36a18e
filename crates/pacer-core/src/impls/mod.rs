//! Implementations of the ports.

pub mod metrics;

pub use metrics::{InMemoryMetrics, NoopMetrics};
