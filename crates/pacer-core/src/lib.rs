//! pacer-core
//!
//! Rate limiting, retries and periodic polling on Tokio.
//!
//! - **domain**: ids, task/limiter states, `TaskDone` records, `TaskError` chains
//! - **queue**: priority queue, token bucket, admission strategies
//! - **limiter**: concurrency limiter over an admission queue, pipeable
//! - **task**: handlers, retry policy, single/group/sequence tasks
//! - **polling**: polling groups, fast/slow/off manager, executors, scheduler
//! - **ports** / **impls**: metrics sink and its implementations
//! - **observability**: status snapshots

pub mod domain;
pub mod error;
pub mod impls;
pub mod limiter;
pub mod observability;
pub mod polling;
pub mod ports;
pub mod queue;
pub mod task;

mod sync;

pub use domain::{ErrorKind, LimiterState, TaskDone, TaskError, TaskStatus, TaskUuid};
pub use error::{PacerError, Result, ValidationError};
pub use limiter::{Completion, Limiter, LimiterEvent, LimiterOptions};
pub use polling::{PollingManager, Scheduler, SchedulerConfig, SchedulerOptions};
pub use task::{HandlerRegistry, RetryPolicy, RetryableTask, SequencePattern, Single, TaskHandler, TaskOptions};
