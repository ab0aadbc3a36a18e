//! Task failure chain.
//!
//! A `TaskError` is a message plus the errors that caused it. Retries,
//! groups and sequences wrap the raw failure of a handler instead of
//! flattening it to a string, so callers can walk the chain and find the
//! failing phase or sub-task.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Classification of a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// The handler returned an error.
    Execution,
    /// One attempt exceeded its timeout.
    Timeout,
    /// Every attempt failed.
    RetryExhausted,
    /// At least one member of a group failed.
    Aggregate,
    /// A phase of a sequence failed.
    Phase,
    /// The task was cancelled or dropped before it ran.
    Cancelled,
    /// The task could not be admitted by a queue.
    Scheduling,
}

/// A failure with its causal chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    kind: ErrorKind,
    message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    causes: Vec<TaskError>,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            causes: Vec::new(),
        }
    }

    /// Raw failure raised by a handler.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Execution, message)
    }

    pub fn timeout(limit: std::time::Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("The task exceeded its timeout of {} ms", limit.as_millis()),
        )
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    /// Wrap the last raw failure once every attempt has been used.
    pub fn retry_exhausted(attempts: u32, last: TaskError) -> Self {
        Self::new(
            ErrorKind::RetryExhausted,
            format!("Too many attempts [{attempts}], the task will not be retried"),
        )
        .caused_by(last)
    }

    /// Group failure listing every failing member.
    pub fn aggregate(causes: Vec<TaskError>) -> Self {
        Self {
            kind: ErrorKind::Aggregate,
            message: "At least one of the tasks grouped failed".to_string(),
            causes,
        }
    }

    /// Sequence failure of the `pre`, `post` or `finally` phase.
    pub fn phase(phase: &str, causes: Vec<TaskError>) -> Self {
        Self {
            kind: ErrorKind::Phase,
            message: format!("Error executing the [{phase}] phase of the sequence"),
            causes,
        }
    }

    /// Sequence failure of the main task. Carries no phase tag.
    pub fn sequence_task(cause: TaskError) -> Self {
        Self::new(ErrorKind::Phase, "Error executing the main task of the sequence").caused_by(cause)
    }

    pub fn caused_by(mut self, cause: TaskError) -> Self {
        self.causes.push(cause);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn causes(&self) -> &[TaskError] {
        &self.causes
    }

    /// Depth-first search through the chain, including `self`.
    pub fn find(&self, predicate: &dyn Fn(&TaskError) -> bool) -> Option<&TaskError> {
        if predicate(self) {
            return Some(self);
        }
        self.causes.iter().find_map(|cause| cause.find(predicate))
    }

    /// Messages of the chain in depth-first order.
    pub fn trace(&self) -> Vec<String> {
        let mut out = vec![self.message.clone()];
        for cause in &self.causes {
            out.extend(cause.trace().into_iter().map(|line| format!("  {line}")));
        }
        out
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if !self.causes.is_empty() {
            let joined = self
                .causes
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            write!(f, ": caused by {joined}")?;
        }
        Ok(())
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.causes.first().map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn retry_exhausted_wraps_last_error() {
        let err = TaskError::retry_exhausted(3, TaskError::execution("boom"));

        assert_eq!(err.kind(), ErrorKind::RetryExhausted);
        assert_eq!(
            err.message(),
            "Too many attempts [3], the task will not be retried"
        );
        assert_eq!(err.causes()[0].message(), "boom");
        assert_eq!(err.source().unwrap().to_string(), "boom");
    }

    #[test]
    fn aggregate_keeps_every_cause() {
        let err = TaskError::aggregate(vec![
            TaskError::execution("first"),
            TaskError::execution("second"),
        ]);

        assert_eq!(err.causes().len(), 2);
        assert!(err.to_string().contains("first"));
        assert!(err.to_string().contains("second"));
    }

    #[test]
    fn find_walks_nested_chain() {
        let err = TaskError::phase(
            "pre",
            vec![TaskError::retry_exhausted(1, TaskError::execution("deep"))],
        );

        let found = err.find(&|e| e.message() == "deep");
        assert!(found.is_some());
        assert_eq!(err.trace().len(), 3);
    }

    #[test]
    fn kind_serializes_camel_case() {
        let s = serde_json::to_string(&ErrorKind::RetryExhausted).unwrap();
        assert_eq!(s, "\"retryExhausted\"");
    }
}
