//! Terminal record of a task instance.
//!
//! Every retryable task emits exactly one `TaskDone`, whether it completed,
//! failed, or never ran because it was cancelled, cleared or evicted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::TaskError;
use super::ids::TaskUuid;
use super::state::TaskStatus;

/// Timestamps and status of a task instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetadata {
    pub uuid: TaskUuid,
    pub task_id: String,
    pub status: TaskStatus,
    pub priority: i32,
    pub weight: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Wall time between start and end of execution, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl TaskMetadata {
    pub fn new(uuid: TaskUuid, task_id: String, priority: i32, weight: u32) -> Self {
        Self {
            uuid,
            task_id,
            status: TaskStatus::Pending,
            priority,
            weight,
            created_at: Utc::now(),
            executed_at: None,
            completed_at: None,
            failed_at: None,
            cancelled_at: None,
            duration_ms: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = TaskStatus::Running;
        self.executed_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self) {
        let now = Utc::now();
        self.status = TaskStatus::Completed;
        self.completed_at = Some(now);
        self.duration_ms = self.elapsed_since_start(now);
    }

    pub fn mark_failed(&mut self) {
        let now = Utc::now();
        self.status = TaskStatus::Failed;
        self.failed_at = Some(now);
        self.duration_ms = self.elapsed_since_start(now);
    }

    pub fn mark_cancelled(&mut self) {
        let now = Utc::now();
        self.status = TaskStatus::Cancelled;
        self.cancelled_at = Some(now);
        self.duration_ms = self.elapsed_since_start(now);
    }

    fn elapsed_since_start(&self, now: DateTime<Utc>) -> Option<u64> {
        let started = self.executed_at?;
        Some((now - started).num_milliseconds().max(0) as u64)
    }
}

/// The single terminal event of a task instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDone {
    pub uuid: TaskUuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub metadata: TaskMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

impl TaskDone {
    pub fn completed(mut metadata: TaskMetadata, result: serde_json::Value) -> Self {
        metadata.mark_completed();
        Self {
            uuid: metadata.uuid,
            result: Some(result),
            metadata,
            error: None,
        }
    }

    pub fn failed(mut metadata: TaskMetadata, error: TaskError) -> Self {
        metadata.mark_failed();
        Self {
            uuid: metadata.uuid,
            result: None,
            metadata,
            error: Some(error),
        }
    }

    pub fn cancelled(mut metadata: TaskMetadata, error: TaskError) -> Self {
        metadata.mark_cancelled();
        Self {
            uuid: metadata.uuid,
            result: None,
            metadata,
            error: Some(error),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.metadata.task_id
    }

    pub fn status(&self) -> TaskStatus {
        self.metadata.status
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Convert into the caller-facing result of `execute`.
    pub fn into_result(self) -> Result<serde_json::Value, TaskError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(serde_json::Value::Null)),
        }
    }
}
