//! resource → polling group → entry の設定から、Limiter と PollingManager を組み立てる。
//!
//! resource ごとに Limiter を 1 つ、(resource, polling group) ごとに
//! PollingManager を 1 つ作ります。`global` があれば各 Limiter はそこへ pipe されます。

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

use super::config::SchedulerConfig;
use super::events::PollingEvent;
use super::executor::PollingExecutor;
use super::group::PollingGroup;
use super::manager::{PollingManager, PollingOptions};
use crate::error::{PacerError, ValidationError};
use crate::impls::NoopMetrics;
use crate::limiter::{Limiter, LimiterOptions};
use crate::observability::{GroupStatus, SchedulerStatus};
use crate::ports::MetricsSink;
use crate::sync::lock;
use crate::task::HandlerRegistry;

const EVENT_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerOptions {
    /// Options of the limiter created for each resource.
    pub limiter: LimiterOptions,
    /// Shared limiter every resource limiter is piped into.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global: Option<LimiterOptions>,
    #[serde(flatten)]
    pub polling: PollingOptions,
}

impl SchedulerOptions {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.limiter.validate()?;
        if let Some(global) = &self.global {
            global.validate()?;
        }
        self.polling.validate()
    }
}

/// Polling of every configured resource.
///
/// One limiter per resource, one polling manager per (resource, polling
/// group). Nothing runs until `start`.
pub struct Scheduler {
    managers: Vec<PollingManager>,
    limiters: BTreeMap<String, Limiter>,
    global: Option<Limiter>,
    executors: Mutex<Vec<PollingExecutor>>,
    events: broadcast::Sender<PollingEvent>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        registry: HandlerRegistry,
        options: SchedulerOptions,
    ) -> Result<Self, ValidationError> {
        Self::with_metrics(config, registry, options, Arc::new(NoopMetrics))
    }

    pub fn with_metrics(
        config: SchedulerConfig,
        registry: HandlerRegistry,
        options: SchedulerOptions,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, ValidationError> {
        options.validate()?;
        config.validate()?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let global = match &options.global {
            Some(global) => Some(Limiter::new(LimiterOptions {
                auto_start: false,
                ..global.clone()
            })?),
            None => None,
        };

        let mut managers = Vec::new();
        let mut limiters = BTreeMap::new();
        for (resource, groups) in config.resources {
            let limiter = Limiter::new(LimiterOptions {
                auto_start: false,
                ..options.limiter.clone()
            })?;
            if let Some(global) = &global {
                limiter.pipe(global)?;
            }

            for (label, entries) in groups {
                let group: PollingGroup = label.parse()?;
                let manager = PollingManager::builder(resource.clone(), group, limiter.clone())
                    .entries(entries)
                    .registry(registry.clone())
                    .options(options.polling.clone())
                    .metrics(metrics.clone())
                    .events(events.clone())
                    .build()?;
                managers.push(manager);
            }
            limiters.insert(resource, limiter);
        }

        Ok(Self {
            managers,
            limiters,
            global,
            executors: Mutex::new(Vec::new()),
            events,
        })
    }

    /// Parse a JSON configuration document and build the scheduler.
    pub fn from_json(
        json: &str,
        registry: HandlerRegistry,
        options: SchedulerOptions,
    ) -> Result<Self, PacerError> {
        let config = SchedulerConfig::from_json(json)?;
        Ok(Self::new(config, registry, options)?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PollingEvent> {
        self.events.subscribe()
    }

    pub fn managers(&self) -> &[PollingManager] {
        &self.managers
    }

    pub fn limiter(&self, resource: &str) -> Option<&Limiter> {
        self.limiters.get(resource)
    }

    pub fn is_running(&self) -> bool {
        !lock(&self.executors).is_empty()
    }

    /// Start the limiters and one executor per polling group. Idempotent.
    pub fn start(&self) {
        let mut executors = lock(&self.executors);
        if !executors.is_empty() {
            return;
        }
        if let Some(global) = &self.global {
            global.start();
        }
        for limiter in self.limiters.values() {
            limiter.start();
        }
        executors.extend(self.managers.iter().cloned().map(PollingExecutor::spawn));
        info!(
            resources = self.limiters.len(),
            groups = self.managers.len(),
            "scheduler started"
        );
    }

    /// Stop every executor and limiter. Tasks already running finish.
    pub async fn stop(&self) {
        let executors: Vec<PollingExecutor> = lock(&self.executors).drain(..).collect();
        for executor in executors {
            executor.stop_and_join().await;
        }
        for limiter in self.limiters.values() {
            limiter.stop();
        }
        if let Some(global) = &self.global {
            global.stop();
        }
        info!("scheduler stopped");
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            running: self.is_running(),
            groups: self
                .managers
                .iter()
                .map(|manager| GroupStatus {
                    resource: manager.resource().to_string(),
                    group: manager.group().label().to_string(),
                    stats: manager.stats(),
                })
                .collect(),
            limiters: self
                .limiters
                .iter()
                .map(|(resource, limiter)| (resource.clone(), limiter.snapshot()))
                .collect(),
            global: self.global.as_ref().map(Limiter::snapshot),
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("managers", &self.managers)
            .field("resources", &self.limiters.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
