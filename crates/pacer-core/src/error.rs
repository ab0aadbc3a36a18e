use thiserror::Error;

use crate::domain::TaskError;

/// Malformed construction options.
///
/// Always returned by constructors, never recovered internally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("validation error: {message}")]
pub struct ValidationError {
    message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Error)]
pub enum PacerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The queue rejected the job (full under `overflow`, or blocked).
    #[error("the job could not be scheduled: {0}")]
    Scheduling(String),

    #[error("task failed: {0}")]
    Task(#[from] TaskError),

    /// A polling entry could not be turned into a runnable task.
    #[error("task {id} could not be constructed: {reason}")]
    ConstructionFailure { id: String, reason: String },

    #[error("invalid configuration document: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PacerError>;
