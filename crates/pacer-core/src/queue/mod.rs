//! Admission control: priority ordering, overflow strategies, token bucket.

mod admission;
mod bucket;
mod options;
mod priority;

pub use admission::{Admission, AdmissionQueue, QueueEvent};
pub use bucket::TokenBucket;
pub use options::{QueueOptions, Strategy};
pub use priority::{Job, PriorityQueue};
