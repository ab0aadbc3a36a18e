//! Domain model (ids, states, task outcomes, failure chains).

pub mod errors;
pub mod ids;
pub mod outcome;
pub mod state;

pub use errors::{ErrorKind, TaskError};
pub use ids::{JobId, TaskUuid};
pub use outcome::{TaskDone, TaskMetadata};
pub use state::{LimiterState, TaskStatus};
