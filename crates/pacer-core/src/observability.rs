//! Read-only status views.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::LimiterState;
use crate::polling::CycleStats;

/// Point-in-time view of a limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterSnapshot {
    pub state: LimiterState,
    pub queued: usize,
    pub in_flight: usize,
    /// `None` when unbounded.
    pub concurrency: Option<usize>,
    pub blocked: bool,
    /// `None` when the token bucket is disabled.
    pub bucket_level: Option<u32>,
    pub piped: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupStatus {
    pub resource: String,
    pub group: String,
    pub stats: CycleStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub running: bool,
    pub groups: Vec<GroupStatus>,
    /// Per-resource limiter snapshots.
    pub limiters: BTreeMap<String, LimiterSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global: Option<LimiterSnapshot>,
}

impl SchedulerStatus {
    /// Total queued plus in-flight tasks across every resource limiter.
    pub fn outstanding(&self) -> usize {
        self.limiters
            .values()
            .map(|snapshot| snapshot.queued + snapshot.in_flight)
            .sum()
    }
}
