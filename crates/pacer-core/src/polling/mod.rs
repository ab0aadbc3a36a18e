//! Periodic polling: cadences, fast/slow/off classification and the
//! scheduler tying resources, limiters and executors together.

mod config;
mod events;
mod executor;
mod group;
mod manager;
mod retry_manager;
mod scheduler;
mod stats;

pub use config::{
    EntryOptions, PatternConfig, ResourceConfig, SchedulerConfig, TaskCall, TaskEntryConfig,
    TaskShape,
};
pub use events::{Bucket, PollingEvent, PollingEventKind};
pub use executor::PollingExecutor;
pub use group::PollingGroup;
pub use manager::{DEFAULT_SLOW_CYCLE_RATIO, PollingManager, PollingManagerBuilder, PollingOptions};
pub use retry_manager::{DEFAULT_MAX_TIMEOUT, MAX_FAST_ATTEMPTS, RetryManager};
pub use scheduler::{Scheduler, SchedulerOptions};
pub use stats::{CycleStats, DEFAULT_CYCLES_ON_STATS};
