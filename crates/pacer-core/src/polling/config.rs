//! Polling configuration: resources → polling groups → task entries.
//!
//! A task entry is an object with exactly one of `task`, `tasks` or
//! `pattern`, plus `options` carrying at least an `id`:
//!
//! ```json
//! { "task": "ping", "args": ["db-1"], "options": { "id": "ping-db-1" } }
//! { "tasks": [{ "task": "a" }, { "task": "b" }], "options": { "id": "both" } }
//! { "pattern": { "pre": [{ "task": "login" }], "task": { "task": "read" },
//!                "post": [], "finally": [{ "task": "logout" }] },
//!   "options": { "id": "session", "priority": 2 } }
//! ```
//!
//! The shape is decided once, when the configuration is parsed.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{PacerError, ValidationError};
use crate::task::{HandlerRegistry, RetryPolicy, RetryableTask, SequencePattern, Single, TaskOptions};

const MAX_ID_LEN: usize = 255;

/// One handler invocation by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TaskCall {
    pub task: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_options: Option<RetryPolicy>,
}

impl TaskCall {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            args: Vec::new(),
            retry_options: None,
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// A call-level policy may only tighten the entry's bucket policy.
    fn resolve(&self, id: &str, registry: &HandlerRegistry, bucket: &RetryPolicy) -> Result<Single, PacerError> {
        let handler = registry
            .get(&self.task)
            .ok_or_else(|| PacerError::ConstructionFailure {
                id: id.to_string(),
                reason: format!("handler `{}` is not registered", self.task),
            })?;
        let single = Single::from_arc(handler).with_args(self.args.clone());
        Ok(match &self.retry_options {
            Some(retry) => single.with_retry(retry.bounded_by(bucket)),
            None => single,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatternConfig {
    #[serde(default)]
    pub pre: Vec<TaskCall>,
    pub task: TaskCall,
    #[serde(default)]
    pub post: Vec<TaskCall>,
    #[serde(default)]
    pub finally: Vec<TaskCall>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryOptions {
    pub id: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// User retry policy; the polling layer derives fast and slow policies
    /// from it.
    #[serde(default)]
    pub retry_options: RetryPolicy,
}

fn default_weight() -> u32 {
    1
}

impl EntryOptions {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            priority: 0,
            weight: 1,
            retry_options: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskShape {
    Single(TaskCall),
    Group(Vec<TaskCall>),
    Sequence(PatternConfig),
}

/// A validated task entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct TaskEntryConfig {
    pub shape: TaskShape,
    pub options: EntryOptions,
}

impl TaskEntryConfig {
    pub fn single(call: TaskCall, options: EntryOptions) -> Self {
        Self {
            shape: TaskShape::Single(call),
            options,
        }
    }

    pub fn group(calls: Vec<TaskCall>, options: EntryOptions) -> Self {
        Self {
            shape: TaskShape::Group(calls),
            options,
        }
    }

    pub fn sequence(pattern: PatternConfig, options: EntryOptions) -> Self {
        Self {
            shape: TaskShape::Sequence(pattern),
            options,
        }
    }

    pub fn id(&self) -> &str {
        &self.options.id
    }

    /// Handler names referenced by this entry.
    pub fn handler_names(&self) -> Vec<&str> {
        match &self.shape {
            TaskShape::Single(call) => vec![call.task.as_str()],
            TaskShape::Group(calls) => calls.iter().map(|c| c.task.as_str()).collect(),
            TaskShape::Sequence(pattern) => pattern
                .pre
                .iter()
                .chain(std::iter::once(&pattern.task))
                .chain(&pattern.post)
                .chain(&pattern.finally)
                .map(|c| c.task.as_str())
                .collect(),
        }
    }

    /// Build a fresh task instance running under `retry`.
    pub fn build(&self, registry: &HandlerRegistry, retry: &RetryPolicy) -> Result<RetryableTask, PacerError> {
        let id = self.id();
        let options = TaskOptions {
            task_id: Some(id.to_string()),
            priority: self.options.priority,
            weight: Some(self.options.weight),
            retry: Some(retry.clone()),
        };
        let resolve_all = |calls: &[TaskCall]| -> Result<Vec<Single>, PacerError> {
            calls.iter().map(|call| call.resolve(id, registry, retry)).collect()
        };

        let built = match &self.shape {
            TaskShape::Single(call) => RetryableTask::single(call.resolve(id, registry, retry)?, options),
            TaskShape::Group(calls) => RetryableTask::group(resolve_all(calls)?, options),
            TaskShape::Sequence(pattern) => {
                let sequence = SequencePattern::new(pattern.task.resolve(id, registry, retry)?)
                    .with_pre(resolve_all(&pattern.pre)?)
                    .with_post(resolve_all(&pattern.post)?)
                    .with_finally(resolve_all(&pattern.finally)?);
                RetryableTask::sequence(sequence, options)
            }
        };
        built.map_err(|err| PacerError::ConstructionFailure {
            id: id.to_string(),
            reason: err.message().to_string(),
        })
    }
}

impl TryFrom<Value> for TaskEntryConfig {
    type Error = ValidationError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Object(mut object) = value else {
            return Err(ValidationError::new(format!(
                "task entries must be objects, got `{value}`"
            )));
        };

        let options_value = object
            .remove("options")
            .ok_or_else(|| ValidationError::new("task entry is missing `options`"))?;
        let options: EntryOptions = serde_json::from_value(options_value)
            .map_err(|err| ValidationError::new(format!("invalid task entry options: {err}")))?;
        validate_id(&options.id)?;
        options
            .retry_options
            .validate()
            .map_err(|err| ValidationError::new(format!("task `{}`: {}", options.id, err.message())))?;

        let present: Vec<&str> = ["task", "tasks", "pattern"]
            .into_iter()
            .filter(|key| object.contains_key(*key))
            .collect();
        let shape = match present.as_slice() {
            ["task"] => TaskShape::Single(parse(&options.id, Value::Object(object))?),
            ["tasks"] => {
                let calls: Vec<TaskCall> = parse(&options.id, take_only(object, "tasks", &options.id)?)?;
                if calls.is_empty() {
                    return Err(ValidationError::new(format!(
                        "task `{}`: `tasks` must not be empty",
                        options.id
                    )));
                }
                TaskShape::Group(calls)
            }
            ["pattern"] => TaskShape::Sequence(parse(&options.id, take_only(object, "pattern", &options.id)?)?),
            [] => {
                return Err(ValidationError::new(format!(
                    "task `{}` needs one of `task`, `tasks` or `pattern`",
                    options.id
                )));
            }
            many => {
                return Err(ValidationError::new(format!(
                    "task `{}` must have exactly one of `task`, `tasks` or `pattern`, found {}",
                    options.id,
                    many.join(", ")
                )));
            }
        };
        Ok(Self { shape, options })
    }
}

impl From<TaskEntryConfig> for Value {
    fn from(entry: TaskEntryConfig) -> Self {
        let mut object = Map::new();
        match entry.shape {
            TaskShape::Single(call) => {
                if let Ok(Value::Object(call)) = serde_json::to_value(call) {
                    object.extend(call);
                }
            }
            TaskShape::Group(calls) => {
                object.insert("tasks".into(), serde_json::to_value(calls).unwrap_or_default());
            }
            TaskShape::Sequence(pattern) => {
                object.insert("pattern".into(), serde_json::to_value(pattern).unwrap_or_default());
            }
        }
        object.insert(
            "options".into(),
            serde_json::to_value(entry.options).unwrap_or_default(),
        );
        Value::Object(object)
    }
}

fn parse<T: serde::de::DeserializeOwned>(id: &str, value: Value) -> Result<T, ValidationError> {
    serde_json::from_value(value).map_err(|err| ValidationError::new(format!("task `{id}`: {err}")))
}

fn take_only(mut object: Map<String, Value>, key: &str, id: &str) -> Result<Value, ValidationError> {
    let value = object.remove(key).unwrap_or_default();
    if let Some(extra) = object.keys().next() {
        return Err(ValidationError::new(format!(
            "task `{id}`: unexpected field `{extra}` next to `{key}`"
        )));
    }
    Ok(value)
}

fn validate_id(id: &str) -> Result<(), ValidationError> {
    if id.trim().is_empty() {
        return Err(ValidationError::new("task entry ids must not be empty"));
    }
    if id.chars().count() > MAX_ID_LEN {
        return Err(ValidationError::new(format!(
            "task id `{id}` is longer than {MAX_ID_LEN} characters"
        )));
    }
    Ok(())
}

/// Polling groups of one resource, keyed by cadence label.
pub type ResourceConfig = BTreeMap<String, Vec<TaskEntryConfig>>;

/// The whole polling configuration, keyed by resource name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub resources: BTreeMap<String, ResourceConfig>,
}

impl SchedulerConfig {
    pub fn from_json(json: &str) -> Result<Self, PacerError> {
        let value: Value = serde_json::from_str(json)?;
        Ok(Self::from_value(value)?)
    }

    /// Walk the document by hand so errors name the offending key.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        let Value::Object(mut root) = value else {
            return Err(ValidationError::new("the polling configuration must be an object"));
        };
        let Some(Value::Object(resources)) = root.remove("resources") else {
            return Err(ValidationError::new("the polling configuration needs a `resources` object"));
        };

        let mut config = SchedulerConfig::default();
        for (resource, groups) in resources {
            let Value::Object(groups) = groups else {
                return Err(ValidationError::new(format!(
                    "resource `{resource}` must map polling groups to task lists"
                )));
            };
            let mut resource_config = ResourceConfig::new();
            for (group, entries) in groups {
                let Value::Array(entries) = entries else {
                    return Err(ValidationError::new(format!(
                        "polling group `{group}` of resource `{resource}` must be an array of tasks"
                    )));
                };
                let entries = entries
                    .into_iter()
                    .map(TaskEntryConfig::try_from)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|err| {
                        ValidationError::new(format!("{resource}/{group}: {}", err.message()))
                    })?;
                resource_config.insert(group, entries);
            }
            config.resources.insert(resource, resource_config);
        }
        config.validate()?;
        Ok(config)
    }

    /// Structural checks shared by programmatic and parsed configurations.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.resources.is_empty() {
            return Err(ValidationError::new("at least one resource must be configured"));
        }
        for (resource, groups) in &self.resources {
            if resource.trim().is_empty() {
                return Err(ValidationError::new("resource names must not be empty"));
            }
            if groups.is_empty() {
                return Err(ValidationError::new(format!(
                    "resource `{resource}` has no polling groups"
                )));
            }
            for (group, entries) in groups {
                group.parse::<super::PollingGroup>()?;
                let mut seen = HashSet::new();
                for entry in entries {
                    if !seen.insert(entry.id()) {
                        return Err(ValidationError::new(format!(
                            "duplicate task id `{}` in {resource}/{group}",
                            entry.id()
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(value: Value) -> Result<TaskEntryConfig, ValidationError> {
        TaskEntryConfig::try_from(value)
    }

    #[test]
    fn single_entry_shape() {
        let parsed = entry(json!({
            "task": "ping",
            "args": ["db-1"],
            "options": { "id": "ping-db", "priority": 2 }
        }))
        .unwrap();

        assert_eq!(parsed.id(), "ping-db");
        assert_eq!(parsed.options.priority, 2);
        assert_eq!(parsed.options.weight, 1);
        assert_eq!(
            parsed.shape,
            TaskShape::Single(TaskCall::new("ping").with_args(vec![json!("db-1")]))
        );
    }

    #[test]
    fn group_and_pattern_shapes() {
        let group = entry(json!({
            "tasks": [{ "task": "a" }, { "task": "b", "args": [1] }],
            "options": { "id": "pair" }
        }))
        .unwrap();
        assert_eq!(group.handler_names(), vec!["a", "b"]);

        let pattern = entry(json!({
            "pattern": {
                "pre": [{ "task": "login" }],
                "task": { "task": "read" },
                "finally": [{ "task": "logout" }]
            },
            "options": { "id": "session" }
        }))
        .unwrap();
        assert_eq!(pattern.handler_names(), vec!["login", "read", "logout"]);
    }

    #[rstest::rstest]
    #[case::not_object(json!("ping"), "objects")]
    #[case::no_options(json!({ "task": "ping" }), "options")]
    #[case::empty_id(json!({ "task": "ping", "options": { "id": "" } }), "empty")]
    #[case::no_shape(json!({ "options": { "id": "x" } }), "needs one of")]
    #[case::two_shapes(json!({ "task": "a", "tasks": [], "options": { "id": "x" } }), "exactly one")]
    #[case::empty_group(json!({ "tasks": [], "options": { "id": "x" } }), "must not be empty")]
    #[case::bad_retry(json!({ "task": "a", "options": { "id": "x", "retryOptions": { "attempts": 0 } } }), "attempts")]
    fn malformed_entries(#[case] value: Value, #[case] mentions: &str) {
        let err = entry(value).unwrap_err();
        assert!(err.message().contains(mentions), "{err}");
    }

    #[test]
    fn entry_round_trips_through_json() {
        let original = entry(json!({
            "tasks": [{ "task": "a" }],
            "options": { "id": "solo", "weight": 2 }
        }))
        .unwrap();
        let value: Value = original.clone().into();
        assert_eq!(entry(value).unwrap(), original);
    }

    #[test]
    fn scheduler_config_from_json() {
        let config = SchedulerConfig::from_json(
            r#"{ "resources": { "db": { "5s": [
                { "task": "ping", "options": { "id": "p" } }
            ] } } }"#,
        )
        .unwrap();
        assert_eq!(config.resources["db"]["5s"].len(), 1);
    }

    #[rstest::rstest]
    #[case::bad_group(r#"{ "resources": { "db": { "often": [] } } }"#, "often")]
    #[case::no_resources(r#"{ "resources": {} }"#, "at least one resource")]
    #[case::duplicate_ids(
        r#"{ "resources": { "db": { "1s": [
            { "task": "a", "options": { "id": "same" } },
            { "task": "b", "options": { "id": "same" } }
        ] } } }"#,
        "duplicate"
    )]
    #[case::entry_error(r#"{ "resources": { "db": { "1s": [ 42 ] } } }"#, "db/1s")]
    fn invalid_scheduler_configs(#[case] json: &str, #[case] mentions: &str) {
        let err = SchedulerConfig::from_json(json).unwrap_err();
        assert!(err.to_string().contains(mentions), "{err}");
    }

    #[test]
    fn build_fails_for_unknown_handler() {
        let config = TaskEntryConfig::single(TaskCall::new("missing"), EntryOptions::new("x"));
        let err = config
            .build(&HandlerRegistry::new(), &RetryPolicy::default())
            .unwrap_err();
        assert!(matches!(err, PacerError::ConstructionFailure { ref id, .. } if id == "x"));
    }
}
