use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::TaskError;
use crate::error::ValidationError;

pub type TaskOutput = Result<Value, TaskError>;

/// A unit of async work invoked with positional JSON arguments.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, args: Vec<Value>) -> TaskOutput;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = TaskOutput> + Send + 'static,
{
    async fn handle(&self, args: Vec<Value>) -> TaskOutput {
        (self)(args).await
    }
}

/// Registry of handlers by name, used to resolve polling configuration.
///
/// Built during initialization, then shared read-only.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: impl TaskHandler + 'static,
    ) -> Result<(), ValidationError> {
        self.register_arc(name, Arc::new(handler))
    }

    /// Duplicate names are an error rather than "last wins".
    pub fn register_arc(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), ValidationError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ValidationError::new("handler names must not be empty"));
        }
        if self.handlers.contains_key(&name) {
            return Err(ValidationError::new(format!(
                "handler `{name}` is already registered"
            )));
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Sorted handler names.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}
