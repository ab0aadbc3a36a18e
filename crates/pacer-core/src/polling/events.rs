use serde::{Deserialize, Serialize};

use super::stats::CycleStats;

/// Which cadence an entry currently runs at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Bucket {
    /// Every cycle.
    Fast,
    /// Every `slowCycleRatio` cycles, single attempt.
    Slow,
    /// Never again; the entry could not be turned into a task.
    Off,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollingEvent {
    pub resource: String,
    pub group: String,
    #[serde(flatten)]
    pub kind: PollingEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PollingEventKind {
    /// An entry recovered and moved back to the fast bucket.
    Fast { id: String },
    /// An entry failed in the fast bucket and was demoted.
    Slow { id: String },
    Off { id: String, reason: String },
    EndCycle { stats: CycleStats },
    Error { id: String, message: String },
}

impl PollingEvent {
    pub fn entry_id(&self) -> Option<&str> {
        match &self.kind {
            PollingEventKind::Fast { id }
            | PollingEventKind::Slow { id }
            | PollingEventKind::Off { id, .. }
            | PollingEventKind::Error { id, .. } => Some(id),
            PollingEventKind::EndCycle { .. } => None,
        }
    }
}
