//! Task shapes: one handler call, a parallel group, or a sequence.

use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::handler::{TaskHandler, TaskOutput};
use super::retry::{RetryPolicy, with_retry};
use crate::domain::TaskError;

/// One handler invocation with its arguments.
///
/// Without its own retry policy it inherits the policy of the enclosing task.
#[derive(Clone)]
pub struct Single {
    handler: Arc<dyn TaskHandler>,
    args: Vec<Value>,
    retry: Option<RetryPolicy>,
}

impl Single {
    pub fn new(handler: impl TaskHandler + 'static) -> Self {
        Self::from_arc(Arc::new(handler))
    }

    pub fn from_arc(handler: Arc<dyn TaskHandler>) -> Self {
        Self {
            handler,
            args: Vec::new(),
            retry: None,
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn retry(&self) -> Option<&RetryPolicy> {
        self.retry.as_ref()
    }

    pub(crate) async fn run(&self, inherited: &RetryPolicy, cancel: &CancellationToken) -> TaskOutput {
        let policy = self.retry.clone().unwrap_or_else(|| inherited.clone());
        with_retry(self.handler.clone(), policy)
            .with_cancel(cancel.clone())
            .handle(self.args.clone())
            .await
    }
}

impl std::fmt::Debug for Single {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Single")
            .field("args", &self.args)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Run every member concurrently. All members run to completion; on failure
/// the errors of the failing members are returned in member order.
pub(crate) async fn run_all(
    tasks: &[Single],
    inherited: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<Vec<Value>, Vec<TaskError>> {
    let outcomes = join_all(tasks.iter().map(|task| task.run(inherited, cancel))).await;

    let mut values = Vec::with_capacity(outcomes.len());
    let mut errors = Vec::new();
    for outcome in outcomes {
        match outcome {
            Ok(value) => values.push(value),
            Err(err) => errors.push(err),
        }
    }
    if errors.is_empty() {
        Ok(values)
    } else {
        Err(errors)
    }
}

/// `pre` → `task` → `post`, with `finally` run regardless of the outcome.
///
/// Each phase is a group run concurrently. The first failing phase
/// short-circuits the remaining ones except `finally`. The result is the
/// value of `task`.
#[derive(Clone, Debug)]
pub struct SequencePattern {
    pub pre: Vec<Single>,
    pub task: Single,
    pub post: Vec<Single>,
    pub finally: Vec<Single>,
}

impl SequencePattern {
    pub fn new(task: Single) -> Self {
        Self {
            pre: Vec::new(),
            task,
            post: Vec::new(),
            finally: Vec::new(),
        }
    }

    pub fn with_pre(mut self, pre: Vec<Single>) -> Self {
        self.pre = pre;
        self
    }

    pub fn with_post(mut self, post: Vec<Single>) -> Self {
        self.post = post;
        self
    }

    pub fn with_finally(mut self, finally: Vec<Single>) -> Self {
        self.finally = finally;
        self
    }

    pub(crate) async fn run(&self, inherited: &RetryPolicy, cancel: &CancellationToken) -> TaskOutput {
        let main = self.run_main(inherited, cancel).await;
        // Cleanup runs even after cancellation.
        let finally = run_all(&self.finally, inherited, &CancellationToken::new()).await;

        match (main, finally) {
            (Err(err), Err(causes)) => {
                warn!(failures = causes.len(), "finally phase failed after a failed sequence");
                Err(err)
            }
            (Err(err), Ok(_)) => Err(err),
            (Ok(_), Err(causes)) => Err(TaskError::phase("finally", causes)),
            (Ok(value), Ok(_)) => Ok(value),
        }
    }

    async fn run_main(&self, inherited: &RetryPolicy, cancel: &CancellationToken) -> TaskOutput {
        run_all(&self.pre, inherited, cancel)
            .await
            .map_err(|causes| TaskError::phase("pre", causes))?;
        let value = self
            .task
            .run(inherited, cancel)
            .await
            .map_err(TaskError::sequence_task)?;
        run_all(&self.post, inherited, cancel)
            .await
            .map_err(|causes| TaskError::phase("post", causes))?;
        Ok(value)
    }
}
