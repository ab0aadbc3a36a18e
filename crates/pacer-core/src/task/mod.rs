//! Retryable tasks: handlers, retry policy and task shapes.

mod handler;
mod pattern;
mod retry;
mod retryable;

pub use handler::{HandlerRegistry, TaskHandler, TaskOutput};
pub use pattern::{SequencePattern, Single};
pub use retry::{RetryPolicy, Retrying, with_retry};
pub use retryable::{RetryableTask, TaskOptions};
