//! Fast/slow/off classification of the entries of one polling group.
//!
//! Every cycle submits the fast entries to the resource's limiter; every
//! `slowCycleRatio` cycles the slow entries go along. A failure in the fast
//! bucket demotes the entry to slow (single attempt), a success in the slow
//! bucket promotes it back. Entries that cannot be turned into a task are
//! switched off for good. A cycle ends when every submitted task is done.
//!
//! # 状態遷移（エントリ単位）
//! - Fast -> Slow: 実行失敗、または Limiter に拒否された
//! - Slow -> Fast: 実行成功
//! - * -> Off: タスクを組み立てられなかった（未登録の handler など）。以後は二度と実行しない
//!
//! バケットが変わるたびに `RetryManager` で retry policy を作り直します。
//! 呼び出し単位の `retryOptions` もこの policy を超えることはできません。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};

use super::config::TaskEntryConfig;
use super::events::{Bucket, PollingEvent, PollingEventKind};
use super::group::PollingGroup;
use super::retry_manager::{DEFAULT_MAX_TIMEOUT, RetryManager};
use super::stats::{CycleHistory, CycleStats, DEFAULT_CYCLES_ON_STATS};
use crate::domain::{TaskDone, TaskUuid};
use crate::error::{PacerError, ValidationError};
use crate::impls::NoopMetrics;
use crate::limiter::Limiter;
use crate::ports::MetricsSink;
use crate::sync::lock;
use crate::task::{HandlerRegistry, RetryPolicy};

pub const DEFAULT_SLOW_CYCLE_RATIO: u32 = 3;
const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PollingOptions {
    /// Slow entries run once every this many cycles.
    pub slow_cycle_ratio: u32,
    /// Size of the rolling window for the average cycle duration.
    pub cycles_on_stats: usize,
    /// Ceiling for derived per-attempt timeouts, in milliseconds.
    #[serde(rename = "maxTimeout")]
    pub max_timeout_ms: u64,
}

impl Default for PollingOptions {
    fn default() -> Self {
        Self {
            slow_cycle_ratio: DEFAULT_SLOW_CYCLE_RATIO,
            cycles_on_stats: DEFAULT_CYCLES_ON_STATS,
            max_timeout_ms: DEFAULT_MAX_TIMEOUT.as_millis() as u64,
        }
    }
}

impl PollingOptions {
    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.slow_cycle_ratio == 0 {
            return Err(ValidationError::new("slowCycleRatio must be >= 1, got 0"));
        }
        if self.cycles_on_stats == 0 {
            return Err(ValidationError::new("cyclesOnStats must be >= 1, got 0"));
        }
        if self.max_timeout_ms == 0 {
            return Err(ValidationError::new("maxTimeout must be > 0"));
        }
        Ok(())
    }
}

struct PollingEntry {
    config: TaskEntryConfig,
    bucket: Bucket,
    retry: RetryPolicy,
}

struct CycleState {
    entries: Vec<PollingEntry>,
    fast_counter: u32,
    /// Submitted and not yet done, by task uuid → entry index.
    pending: HashMap<TaskUuid, usize>,
    started: Option<Instant>,
    history: CycleHistory,
    waiters: Vec<oneshot::Sender<CycleStats>>,
}

impl CycleState {
    fn count(&self, bucket: Bucket) -> usize {
        self.entries.iter().filter(|e| e.bucket == bucket).count()
    }

    fn find(&self, id: &str) -> Option<&PollingEntry> {
        self.entries.iter().find(|e| e.config.id() == id)
    }
}

struct ManagerInner {
    resource: String,
    group: PollingGroup,
    options: PollingOptions,
    limiter: Limiter,
    registry: HandlerRegistry,
    retry_manager: RetryManager,
    metrics: Arc<dyn MetricsSink>,
    events: broadcast::Sender<PollingEvent>,
    runtime: Handle,
    state: Mutex<CycleState>,
}

/// Polling manager of one (resource, polling group) pair.
#[derive(Clone)]
pub struct PollingManager {
    inner: Arc<ManagerInner>,
}

/// Fail-fast construction of a [`PollingManager`].
pub struct PollingManagerBuilder {
    resource: String,
    group: PollingGroup,
    limiter: Limiter,
    entries: Vec<TaskEntryConfig>,
    registry: HandlerRegistry,
    options: PollingOptions,
    metrics: Arc<dyn MetricsSink>,
    events: Option<broadcast::Sender<PollingEvent>>,
}

impl PollingManagerBuilder {
    pub fn entries(mut self, entries: Vec<TaskEntryConfig>) -> Self {
        self.entries = entries;
        self
    }

    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn options(mut self, options: PollingOptions) -> Self {
        self.options = options;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Publish on a shared channel instead of a private one.
    pub fn events(mut self, events: broadcast::Sender<PollingEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Result<PollingManager, ValidationError> {
        self.options.validate()?;
        if self.resource.trim().is_empty() {
            return Err(ValidationError::new("resource names must not be empty"));
        }
        let mut seen = HashSet::new();
        for entry in &self.entries {
            if !seen.insert(entry.id()) {
                return Err(ValidationError::new(format!(
                    "duplicate task id `{}` in {}/{}",
                    entry.id(),
                    self.resource,
                    self.group
                )));
            }
        }
        let runtime = Handle::try_current()
            .map_err(|_| ValidationError::new("the polling manager needs a Tokio runtime"))?;

        let retry_manager = RetryManager::new(
            self.group.period(),
            self.limiter.options().delay(),
            self.options.max_timeout(),
        );
        let entries = self
            .entries
            .into_iter()
            .map(|config| PollingEntry {
                retry: retry_manager.fast(&config.options.retry_options),
                bucket: Bucket::Fast,
                config,
            })
            .collect();
        let events = self
            .events
            .unwrap_or_else(|| broadcast::channel(EVENT_CAPACITY).0);

        Ok(PollingManager {
            inner: Arc::new(ManagerInner {
                state: Mutex::new(CycleState {
                    entries,
                    fast_counter: 0,
                    pending: HashMap::new(),
                    started: None,
                    history: CycleHistory::new(self.options.cycles_on_stats),
                    waiters: Vec::new(),
                }),
                resource: self.resource,
                group: self.group,
                options: self.options,
                limiter: self.limiter,
                registry: self.registry,
                retry_manager,
                metrics: self.metrics,
                events,
                runtime,
            }),
        })
    }
}

impl PollingManager {
    /// Manager with default options and no metrics.
    pub fn new(
        resource: impl Into<String>,
        group: PollingGroup,
        limiter: Limiter,
        entries: Vec<TaskEntryConfig>,
        registry: HandlerRegistry,
    ) -> Result<Self, ValidationError> {
        Self::builder(resource, group, limiter)
            .entries(entries)
            .registry(registry)
            .build()
    }

    pub fn builder(resource: impl Into<String>, group: PollingGroup, limiter: Limiter) -> PollingManagerBuilder {
        PollingManagerBuilder {
            resource: resource.into(),
            group,
            limiter,
            entries: Vec::new(),
            registry: HandlerRegistry::new(),
            options: PollingOptions::default(),
            metrics: Arc::new(NoopMetrics),
            events: None,
        }
    }

    pub fn resource(&self) -> &str {
        &self.inner.resource
    }

    pub fn group(&self) -> &PollingGroup {
        &self.inner.group
    }

    pub fn limiter(&self) -> &Limiter {
        &self.inner.limiter
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PollingEvent> {
        self.inner.events.subscribe()
    }

    pub fn entry_bucket(&self, id: &str) -> Option<Bucket> {
        lock(&self.inner.state).find(id).map(|entry| entry.bucket)
    }

    /// Effective retry policy of an entry in its current bucket.
    pub fn retry_policy(&self, id: &str) -> Option<RetryPolicy> {
        lock(&self.inner.state).find(id).map(|entry| entry.retry.clone())
    }

    pub fn stats(&self) -> CycleStats {
        self.inner.stats_locked(&lock(&self.inner.state))
    }

    /// Start a cycle: submit the due entries to the limiter. Returns how many
    /// tasks were submitted. Does nothing while the previous cycle is
    /// still pending.
    pub fn schedule(&self) -> usize {
        let inner = &self.inner;
        let mut events = Vec::new();
        let mut submitted = Vec::new();
        {
            let mut state = lock(&inner.state);
            if !state.pending.is_empty() {
                warn!(
                    resource = %inner.resource,
                    group = %inner.group,
                    pending = state.pending.len(),
                    "previous cycle still running, skipping"
                );
                return 0;
            }

            state.started = Some(Instant::now());
            state.fast_counter += 1;
            let include_slow = state.fast_counter >= inner.options.slow_cycle_ratio;
            if include_slow {
                state.fast_counter = 0;
            }

            let mut rejected = Vec::new();
            let CycleState { entries, pending, .. } = &mut *state;
            for (index, entry) in entries.iter_mut().enumerate() {
                let due = match entry.bucket {
                    Bucket::Fast => true,
                    Bucket::Slow => include_slow,
                    Bucket::Off => false,
                };
                if !due {
                    continue;
                }

                let task = match entry.config.build(&inner.registry, &entry.retry) {
                    Ok(task) => task,
                    Err(err) => {
                        entry.bucket = Bucket::Off;
                        let id = entry.config.id().to_string();
                        error!(resource = %inner.resource, group = %inner.group, task = %id, error = %err, "task switched off");
                        events.push(inner.event(PollingEventKind::Off {
                            id: id.clone(),
                            reason: err.to_string(),
                        }));
                        events.push(inner.event(PollingEventKind::Error {
                            id,
                            message: err.to_string(),
                        }));
                        continue;
                    }
                };
                match inner.limiter.submit(task) {
                    Ok(completion) => {
                        pending.insert(completion.uuid(), index);
                        submitted.push((index, completion));
                    }
                    Err(err) => {
                        warn!(resource = %inner.resource, task = %entry.config.id(), error = %err, "limiter rejected task");
                        rejected.push(index);
                    }
                }
            }

            for index in rejected {
                inner.record_failure_metric(&state, index);
                inner.reclassify(&mut state, index, false, &mut events);
            }
            debug!(
                resource = %inner.resource,
                group = %inner.group,
                submitted = submitted.len(),
                include_slow,
                "cycle scheduled"
            );
            if state.pending.is_empty() {
                inner.finalize(&mut state, &mut events);
            }
        }

        let count = submitted.len();
        for (index, completion) in submitted {
            let manager = Arc::clone(inner);
            let uuid = completion.uuid();
            inner.runtime.spawn(async move {
                let done = completion.await;
                manager.on_done(index, uuid, done);
            });
        }
        inner.emit(events);
        count
    }

    /// Schedule a cycle and wait for it to end.
    pub async fn run_cycle(&self) -> CycleStats {
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.state).waiters.push(tx);
        self.schedule();
        match rx.await {
            Ok(stats) => stats,
            Err(_) => self.stats(),
        }
    }
}

impl std::fmt::Debug for PollingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingManager")
            .field("resource", &self.inner.resource)
            .field("group", &self.inner.group.label())
            .finish_non_exhaustive()
    }
}

impl ManagerInner {
    fn event(&self, kind: PollingEventKind) -> PollingEvent {
        PollingEvent {
            resource: self.resource.clone(),
            group: self.group.label().to_string(),
            kind,
        }
    }

    fn emit(&self, events: Vec<PollingEvent>) {
        for event in events {
            let _ = self.events.send(event);
        }
    }

    fn on_done(&self, index: usize, uuid: TaskUuid, done: Result<TaskDone, PacerError>) {
        let mut events = Vec::new();
        {
            let mut state = lock(&self.state);
            if state.pending.remove(&uuid).is_none() {
                return;
            }
            let success = matches!(&done, Ok(done) if done.is_success());

            if let Some(entry) = state.entries.get(index) {
                let labels = [
                    ("resource", self.resource.as_str()),
                    ("group", self.group.label()),
                    ("task", entry.config.id()),
                ];
                if let Ok(done) = &done
                    && let Some(duration_ms) = done.metadata.duration_ms
                {
                    self.metrics
                        .observe("polling_task_duration_ms", &labels, duration_ms as f64);
                }
            }
            if !success {
                self.record_failure_metric(&state, index);
            }

            self.reclassify(&mut state, index, success, &mut events);
            if state.pending.is_empty() {
                self.finalize(&mut state, &mut events);
            }
        }
        self.emit(events);
    }

    fn record_failure_metric(&self, state: &CycleState, index: usize) {
        if let Some(entry) = state.entries.get(index) {
            let labels = [
                ("resource", self.resource.as_str()),
                ("group", self.group.label()),
                ("task", entry.config.id()),
            ];
            self.metrics.increment("polling_task_errors_total", &labels, 1);
        }
    }

    /// Move an entry between fast and slow after a run. Off entries stay off.
    fn reclassify(&self, state: &mut CycleState, index: usize, success: bool, events: &mut Vec<PollingEvent>) {
        let Some(entry) = state.entries.get_mut(index) else {
            return;
        };
        let id = entry.config.id().to_string();
        match (entry.bucket, success) {
            (Bucket::Fast, false) => {
                entry.bucket = Bucket::Slow;
                entry.retry = self.retry_manager.slow(&entry.config.options.retry_options);
                info!(resource = %self.resource, group = %self.group, task = %id, "task moved to the slow cycle");
                events.push(self.event(PollingEventKind::Slow { id }));
            }
            (Bucket::Slow, true) => {
                entry.bucket = Bucket::Fast;
                entry.retry = self.retry_manager.fast(&entry.config.options.retry_options);
                info!(resource = %self.resource, group = %self.group, task = %id, "task back in the fast cycle");
                events.push(self.event(PollingEventKind::Fast { id }));
            }
            _ => {}
        }
    }

    fn finalize(&self, state: &mut CycleState, events: &mut Vec<PollingEvent>) {
        let duration = state
            .started
            .take()
            .map(|started| started.elapsed())
            .unwrap_or_default();
        let overrun = duration > self.group.period();
        state.history.record(duration, overrun);
        let stats = self.stats_locked(state);

        let labels = [("resource", self.resource.as_str()), ("group", self.group.label())];
        self.metrics.increment("polling_cycles_total", &labels, 1);
        if overrun {
            self.metrics.increment("polling_overruns_total", &labels, 1);
            warn!(
                resource = %self.resource,
                group = %self.group,
                duration_ms = stats.last_cycle_duration_ms,
                consecutive = stats.consecutive_overruns,
                "cycle overran its period"
            );
        } else {
            debug!(
                resource = %self.resource,
                group = %self.group,
                duration_ms = stats.last_cycle_duration_ms,
                "cycle finished"
            );
        }
        self.metrics.gauge("polling_pending_tasks", &labels, stats.pending_tasks as f64);
        self.metrics.gauge("polling_fast_tasks", &labels, stats.in_fast_cycle_tasks as f64);
        self.metrics.gauge("polling_slow_tasks", &labels, stats.in_slow_cycle_tasks as f64);
        self.metrics.gauge("polling_off_tasks", &labels, stats.in_off_cycle_tasks as f64);

        for waiter in state.waiters.drain(..) {
            let _ = waiter.send(stats.clone());
        }
        events.push(self.event(PollingEventKind::EndCycle { stats }));
    }

    fn stats_locked(&self, state: &CycleState) -> CycleStats {
        CycleStats {
            pending_tasks: state.pending.len(),
            in_fast_cycle_tasks: state.count(Bucket::Fast),
            in_slow_cycle_tasks: state.count(Bucket::Slow),
            in_off_cycle_tasks: state.count(Bucket::Off),
            ..state.history.snapshot()
        }
    }
}
