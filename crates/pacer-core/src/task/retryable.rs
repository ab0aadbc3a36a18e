use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::pattern::{SequencePattern, Single, run_all};
use super::retry::RetryPolicy;
use crate::domain::{ErrorKind, TaskDone, TaskError, TaskMetadata, TaskUuid};
use crate::error::ValidationError;

const MAX_TASK_ID_LEN: usize = 255;

/// Identity and scheduling attributes of a retryable task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskOptions {
    /// Defaults to the generated uuid.
    #[serde(rename = "id", skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub priority: i32,
    /// Tokens consumed when the task leaves the queue. `None` means 1.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    #[serde(rename = "retryOptions", skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

impl TaskOptions {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            task_id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

#[derive(Clone, Debug)]
enum TaskKind {
    Single(Single),
    Group(Vec<Single>),
    Sequence(SequencePattern),
}

/// A task instance with identity, retry policy and lifecycle metadata.
///
/// `run` consumes the task, so each instance produces exactly one
/// [`TaskDone`].
#[derive(Debug)]
pub struct RetryableTask {
    kind: TaskKind,
    retry: Option<RetryPolicy>,
    metadata: TaskMetadata,
    cancel: CancellationToken,
}

impl RetryableTask {
    pub fn single(task: Single, options: TaskOptions) -> Result<Self, ValidationError> {
        Self::build(TaskKind::Single(task), options)
    }

    pub fn group(tasks: Vec<Single>, options: TaskOptions) -> Result<Self, ValidationError> {
        if tasks.is_empty() {
            return Err(ValidationError::new("a task group needs at least one task"));
        }
        Self::build(TaskKind::Group(tasks), options)
    }

    pub fn sequence(pattern: SequencePattern, options: TaskOptions) -> Result<Self, ValidationError> {
        Self::build(TaskKind::Sequence(pattern), options)
    }

    fn build(kind: TaskKind, options: TaskOptions) -> Result<Self, ValidationError> {
        let uuid = TaskUuid::generate();
        let task_id = match options.task_id {
            Some(id) => {
                validate_task_id(&id)?;
                id
            }
            None => uuid.to_string(),
        };
        if let Some(retry) = &options.retry {
            retry.validate()?;
        }
        Ok(Self {
            kind,
            retry: options.retry,
            metadata: TaskMetadata::new(uuid, task_id, options.priority, options.weight.unwrap_or(1)),
            cancel: CancellationToken::new(),
        })
    }

    pub fn uuid(&self) -> TaskUuid {
        self.metadata.uuid
    }

    pub fn task_id(&self) -> &str {
        &self.metadata.task_id
    }

    pub fn priority(&self) -> i32 {
        self.metadata.priority
    }

    pub fn weight(&self) -> u32 {
        self.metadata.weight
    }

    pub fn metadata(&self) -> &TaskMetadata {
        &self.metadata
    }

    pub fn retry(&self) -> Option<&RetryPolicy> {
        self.retry.as_ref()
    }

    /// Token that cancels the task: before it starts it never runs, while
    /// running no further attempt starts and the result is discarded.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Use `policy` unless the task carries its own.
    pub fn inherit_retry(&mut self, policy: &RetryPolicy) {
        if self.retry.is_none() {
            self.retry = Some(policy.clone());
        }
    }

    /// Terminate without running.
    pub fn cancel_with(self, error: TaskError) -> TaskDone {
        TaskDone::cancelled(self.metadata, error)
    }

    pub async fn run(self) -> TaskDone {
        let Self {
            kind,
            retry,
            mut metadata,
            cancel,
        } = self;

        if cancel.is_cancelled() {
            return TaskDone::cancelled(
                metadata,
                TaskError::cancelled("the task was cancelled before it started"),
            );
        }

        let policy = retry.unwrap_or_default();
        metadata.mark_running();
        debug!(task = %metadata.task_id, uuid = %metadata.uuid, "task started");

        let outcome = match &kind {
            TaskKind::Single(task) => task.run(&policy, &cancel).await,
            TaskKind::Group(tasks) => run_all(tasks, &policy, &cancel)
                .await
                .map(Value::Array)
                .map_err(TaskError::aggregate),
            TaskKind::Sequence(pattern) => pattern.run(&policy, &cancel).await,
        };

        if cancel.is_cancelled() {
            debug!(task = %metadata.task_id, "task cancelled while running, discarding its result");
            return TaskDone::cancelled(
                metadata,
                TaskError::cancelled("the task was cancelled while running"),
            );
        }

        match outcome {
            Ok(value) => {
                let done = TaskDone::completed(metadata, value);
                debug!(task = %done.task_id(), duration_ms = ?done.metadata.duration_ms, "task completed");
                done
            }
            Err(err) if err.kind() == ErrorKind::Cancelled => TaskDone::cancelled(metadata, err),
            Err(err) => {
                warn!(task = %metadata.task_id, error = %err, "task failed");
                TaskDone::failed(metadata, err)
            }
        }
    }
}

fn validate_task_id(id: &str) -> Result<(), ValidationError> {
    if id.trim().is_empty() {
        return Err(ValidationError::new("task id must not be empty"));
    }
    if id.chars().count() > MAX_TASK_ID_LEN {
        return Err(ValidationError::new(format!(
            "task id must be at most {MAX_TASK_ID_LEN} characters, got {}",
            id.chars().count()
        )));
    }
    Ok(())
}
