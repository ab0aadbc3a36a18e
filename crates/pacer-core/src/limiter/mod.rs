//! Concurrency limiter over an admission queue.
//!
//! The limiter pulls jobs from its queue while fewer than `concurrency` are
//! in flight, pausing `delay` between starts, and runs each one on the Tokio
//! runtime. Limiters can be piped: a piped limiter hands each job it starts
//! to the downstream limiter instead of running it, so per-resource limits
//! compose with a shared global one.
//!
//! # pull loop
//! 同時に動く pull loop は常に 1 本だけです（`RunState::pulling` で合流）。
//! `kick()` は submit・完了・refill・unblock のたびに呼ばれ、ループが既に
//! 動いていれば何もしません。ロック順は `run` → キューの順で固定です。
//!
//! # 完了通知
//! 受け入れたタスクは必ず 1 回だけ `TaskDone` を返します。
//! clear・evict されたタスクも `cancelled` として `Completion` に届きます。

mod options;

pub use options::{LimiterOptions, UNBOUNDED};

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, trace};

use crate::domain::{ErrorKind, LimiterState, TaskDone, TaskError, TaskStatus, TaskUuid};
use crate::error::{PacerError, ValidationError};
use crate::observability::LimiterSnapshot;
use crate::queue::{AdmissionQueue, Job, QueueEvent};
use crate::sync::lock;
use crate::task::RetryableTask;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum LimiterEvent {
    /// Terminal record of every admitted task, including cancelled ones.
    Done(TaskDone),
    /// Emitted before `Done` when a task failed.
    Error(TaskDone),
    Blocked,
    Unblocked,
    Refill { level: u32 },
}

impl LimiterEvent {
    pub fn done(&self) -> Option<&TaskDone> {
        match self {
            LimiterEvent::Done(done) => Some(done),
            _ => None,
        }
    }
}

/// Resolves to the [`TaskDone`] of a submitted task.
#[derive(Debug)]
pub struct Completion {
    uuid: TaskUuid,
    task_id: String,
    rx: oneshot::Receiver<TaskDone>,
}

impl Completion {
    pub fn uuid(&self) -> TaskUuid {
        self.uuid
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }
}

impl Future for Completion {
    type Output = Result<TaskDone, PacerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.map_err(|_| {
                PacerError::Task(TaskError::cancelled(
                    "the limiter was dropped before the task finished",
                ))
            })
        })
    }
}

struct Pending {
    task: RetryableTask,
    reply: oneshot::Sender<TaskDone>,
}

struct Rejected {
    task: RetryableTask,
    reason: String,
}

#[derive(Default)]
struct RunState {
    running: bool,
    in_flight: usize,
    pulling: bool,
}

struct Inner {
    options: LimiterOptions,
    queue: AdmissionQueue<Pending>,
    run: Mutex<RunState>,
    events: broadcast::Sender<LimiterEvent>,
    pipe: Mutex<Option<Limiter>>,
    runtime: Handle,
}

/// Cheap to clone; clones share the same queue and counters.
#[derive(Clone)]
pub struct Limiter {
    inner: Arc<Inner>,
}

impl Limiter {
    /// Must be called inside a Tokio runtime.
    pub fn new(options: LimiterOptions) -> Result<Self, ValidationError> {
        options.validate()?;
        let runtime = Handle::try_current()
            .map_err(|_| ValidationError::new("the limiter needs a Tokio runtime"))?;
        let queue = AdmissionQueue::new(options.queue.clone())?;
        let queue_events = queue.subscribe();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let inner = Arc::new(Inner {
            run: Mutex::new(RunState {
                running: options.auto_start,
                ..RunState::default()
            }),
            options,
            queue,
            events,
            pipe: Mutex::new(None),
            runtime,
        });
        inner
            .runtime
            .spawn(forward_queue_events(Arc::downgrade(&inner), queue_events));

        Ok(Self { inner })
    }

    pub fn options(&self) -> &LimiterOptions {
        &self.inner.options
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LimiterEvent> {
        self.inner.events.subscribe()
    }

    /// Queue a task. Fails when the admission queue rejects it.
    pub fn submit(&self, task: RetryableTask) -> Result<Completion, PacerError> {
        self.inner
            .admit(task)
            .map_err(|rejected| PacerError::Scheduling(rejected.reason))
    }

    /// Fire and forget. Returns the task id, or `None` when rejected.
    pub fn schedule(&self, task: RetryableTask) -> Option<String> {
        match self.submit(task) {
            Ok(completion) => Some(completion.task_id),
            Err(err) => {
                debug!(error = %err, "task was not scheduled");
                None
            }
        }
    }

    /// Queue a task and wait for its result.
    pub async fn execute(&self, task: RetryableTask) -> Result<Value, PacerError> {
        let done = self.submit(task)?.await?;
        Ok(done.into_result()?)
    }

    /// Hand every job this limiter starts to `downstream` instead of running
    /// it directly. Fails if that would create a cycle.
    pub fn pipe(&self, downstream: &Limiter) -> Result<(), ValidationError> {
        let mut cursor = Some(downstream.clone());
        while let Some(limiter) = cursor {
            if Arc::ptr_eq(&limiter.inner, &self.inner) {
                return Err(ValidationError::new("piping these limiters would create a cycle"));
            }
            cursor = lock(&limiter.inner.pipe).clone();
        }
        *lock(&self.inner.pipe) = Some(downstream.clone());
        Ok(())
    }

    pub fn unpipe(&self) {
        lock(&self.inner.pipe).take();
    }

    pub fn start(&self) {
        lock(&self.inner.run).running = true;
        debug!("limiter started");
        self.inner.kick();
    }

    /// Stop pulling new jobs. In-flight jobs finish normally.
    pub fn stop(&self) {
        lock(&self.inner.run).running = false;
        debug!("limiter stopped");
    }

    pub fn pause(&self) {
        self.stop();
    }

    /// Drop every queued job; each completes as cancelled. Returns how many.
    pub fn clear(&self) -> usize {
        let cleared = self.inner.queue.clear();
        let count = cleared.len();
        for job in cleared {
            self.inner.cancel_pending(job.payload, "the queue was cleared");
        }
        count
    }

    /// Resolve once nothing is queued and nothing is in flight.
    pub async fn wait_until_empty(&self) {
        let mut events = self.subscribe();
        loop {
            if self.size() == 0 && self.in_flight() == 0 {
                return;
            }
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    pub fn size(&self) -> usize {
        self.inner.queue.size()
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.inner.run).in_flight
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.run).running
    }

    pub fn state(&self) -> LimiterState {
        let (running, in_flight) = {
            let run = lock(&self.inner.run);
            (run.running, run.in_flight)
        };
        LimiterState::derive(running, in_flight, self.size())
    }

    pub fn snapshot(&self) -> LimiterSnapshot {
        let (running, in_flight) = {
            let run = lock(&self.inner.run);
            (run.running, run.in_flight)
        };
        let queued = self.size();
        let concurrency = self.inner.options.concurrency;
        LimiterSnapshot {
            state: LimiterState::derive(running, in_flight, queued),
            queued,
            in_flight,
            concurrency: (concurrency != UNBOUNDED).then_some(concurrency),
            blocked: self.inner.queue.is_blocked(),
            bucket_level: self.inner.queue.bucket_level(),
            piped: lock(&self.inner.pipe).is_some(),
        }
    }

    /// Run `task` through this limiter on behalf of an upstream one.
    async fn run_piped(&self, task: RetryableTask) -> TaskDone {
        let metadata = task.metadata().clone();
        match self.inner.admit(task) {
            Ok(completion) => match completion.await {
                Ok(done) => done,
                Err(err) => TaskDone::cancelled(metadata, TaskError::cancelled(err.to_string())),
            },
            Err(rejected) => rejected
                .task
                .cancel_with(TaskError::new(ErrorKind::Scheduling, rejected.reason)),
        }
    }
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl Inner {
    fn admit(self: &Arc<Self>, mut task: RetryableTask) -> Result<Completion, Rejected> {
        task.inherit_retry(&self.options.retry_options);
        let uuid = task.uuid();
        let task_id = task.task_id().to_string();
        let (priority, weight) = (task.priority(), task.weight());

        let (reply, rx) = oneshot::channel();
        let job = Job::new(Pending { task, reply })
            .with_priority(priority)
            .with_weight(weight);
        let admission = self.queue.enqueue(job);

        for evicted in admission.evicted {
            let reason = format!(
                "the job was dropped by the `{}` strategy",
                self.options.queue.strategy
            );
            self.cancel_pending(evicted.payload, &reason);
        }

        if let Some(rejected) = admission.rejected {
            let reason = self.rejection_reason(weight);
            debug!(task = %task_id, reason, "task rejected");
            return Err(Rejected {
                task: rejected.payload.task,
                reason: reason.to_string(),
            });
        }

        trace!(task = %task_id, priority, weight, "task queued");
        self.kick();
        Ok(Completion { uuid, task_id, rx })
    }

    fn rejection_reason(&self, weight: u32) -> &'static str {
        let queue = &self.options.queue;
        if self.queue.is_blocked() {
            "the queue is blocked"
        } else if queue.bucket_enabled() && weight > queue.bucket_size {
            "the job weight exceeds the bucket size"
        } else {
            "the queue is at high water"
        }
    }

    fn cancel_pending(&self, pending: Pending, reason: &str) {
        let done = pending.task.cancel_with(TaskError::cancelled(reason));
        let _ = self.events.send(LimiterEvent::Done(done.clone()));
        let _ = pending.reply.send(done);
    }

    /// Start the pull loop unless one is already running.
    fn kick(self: &Arc<Self>) {
        {
            let mut run = lock(&self.run);
            if !run.running || run.pulling {
                return;
            }
            run.pulling = true;
        }
        let inner = Arc::clone(self);
        self.runtime.spawn(inner.pull_loop());
    }

    async fn pull_loop(self: Arc<Self>) {
        let delay = self.options.delay();
        loop {
            let job = {
                let mut run = lock(&self.run);
                if !run.running || run.in_flight >= self.options.concurrency {
                    run.pulling = false;
                    return;
                }
                match self.queue.dequeue() {
                    Some(job) => {
                        run.in_flight += 1;
                        job
                    }
                    None => {
                        run.pulling = false;
                        return;
                    }
                }
            };
            self.launch(job.payload);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    fn launch(self: &Arc<Self>, pending: Pending) {
        let inner = Arc::clone(self);
        let downstream = lock(&self.pipe).clone();
        self.runtime.spawn(async move {
            let Pending { task, reply } = pending;
            let done = match downstream {
                Some(downstream) => downstream.run_piped(task).await,
                None => task.run().await,
            };
            inner.finish(done, reply);
        });
    }

    fn finish(self: &Arc<Self>, done: TaskDone, reply: oneshot::Sender<TaskDone>) {
        {
            let mut run = lock(&self.run);
            run.in_flight = run.in_flight.saturating_sub(1);
        }
        if done.status() == TaskStatus::Failed {
            let _ = self.events.send(LimiterEvent::Error(done.clone()));
        }
        let _ = self.events.send(LimiterEvent::Done(done.clone()));
        let _ = reply.send(done);
        self.kick();
    }
}

async fn forward_queue_events(inner: Weak<Inner>, mut events: broadcast::Receiver<QueueEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(_)) => None,
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            Some(QueueEvent::Blocked) => {
                let _ = inner.events.send(LimiterEvent::Blocked);
            }
            Some(QueueEvent::Unblocked) => {
                let _ = inner.events.send(LimiterEvent::Unblocked);
                inner.kick();
            }
            Some(QueueEvent::Refill { level }) => {
                let _ = inner.events.send(LimiterEvent::Refill { level });
                inner.kick();
            }
            None => inner.kick(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{QueueOptions, Strategy};
    use crate::task::{Single, TaskOptions};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn sleeper(id: &str, millis: u64) -> RetryableTask {
        let single = Single::new(move |_args: Vec<Value>| async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok::<_, TaskError>(json!(millis))
        });
        RetryableTask::single(single, TaskOptions::with_id(id)).unwrap()
    }

    fn failing(id: &str) -> RetryableTask {
        let single = Single::new(|_args: Vec<Value>| async {
            Err::<Value, _>(TaskError::execution("nope"))
        });
        RetryableTask::single(single, TaskOptions::with_id(id)).unwrap()
    }

    #[tokio::test]
    async fn execute_returns_value() {
        let limiter = Limiter::new(LimiterOptions::default()).unwrap();
        let value = limiter.execute(sleeper("one", 1)).await.unwrap();
        assert_eq!(value, json!(1));
        assert_eq!(limiter.state(), LimiterState::Empty);
    }

    #[tokio::test]
    async fn execute_surfaces_task_error() {
        let limiter = Limiter::new(LimiterOptions::default()).unwrap();
        let err = limiter.execute(failing("bad")).await.unwrap_err();
        match err {
            PacerError::Task(err) => assert_eq!(err.kind(), ErrorKind::RetryExhausted),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn failed_task_emits_error_then_done() {
        let limiter = Limiter::new(LimiterOptions::default()).unwrap();
        let mut events = limiter.subscribe();
        limiter.schedule(failing("bad")).unwrap();

        assert!(matches!(events.recv().await.unwrap(), LimiterEvent::Error(_)));
        let done = events.recv().await.unwrap();
        assert_eq!(done.done().unwrap().status(), TaskStatus::Failed);
    }

    #[tokio::test]
    async fn concurrency_is_never_exceeded() {
        let limiter = Limiter::new(LimiterOptions::with_concurrency(2)).unwrap();
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut completions = Vec::new();
        for i in 0..8 {
            let (current, peak) = (current.clone(), peak.clone());
            let single = Single::new(move |_args: Vec<Value>| {
                let (current, peak) = (current.clone(), peak.clone());
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, TaskError>(Value::Null)
                }
            });
            let task = RetryableTask::single(single, TaskOptions::with_id(format!("t{i}"))).unwrap();
            completions.push(limiter.submit(task).unwrap());
        }
        for completion in completions {
            assert!(completion.await.unwrap().is_success());
        }

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[tokio::test]
    async fn stopped_limiter_holds_jobs_until_started() {
        let options = LimiterOptions {
            auto_start: false,
            ..LimiterOptions::default()
        };
        let limiter = Limiter::new(options).unwrap();
        let completion = limiter.submit(sleeper("held", 1)).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(limiter.state(), LimiterState::Stopped);
        assert_eq!(limiter.size(), 1);

        limiter.start();
        assert!(completion.await.unwrap().is_success());
    }

    #[tokio::test]
    async fn clear_cancels_queued_jobs() {
        let options = LimiterOptions {
            auto_start: false,
            ..LimiterOptions::default()
        };
        let limiter = Limiter::new(options).unwrap();
        let first = limiter.submit(sleeper("a", 1)).unwrap();
        let second = limiter.submit(sleeper("b", 1)).unwrap();

        assert_eq!(limiter.clear(), 2);
        for completion in [first, second] {
            let done = completion.await.unwrap();
            assert_eq!(done.status(), TaskStatus::Cancelled);
        }
        assert_eq!(limiter.size(), 0);
    }

    #[tokio::test]
    async fn overflow_rejects_with_scheduling_error() {
        let options = LimiterOptions {
            auto_start: false,
            queue: QueueOptions {
                high_water: Some(1),
                strategy: Strategy::Overflow,
                ..QueueOptions::default()
            },
            ..LimiterOptions::default()
        };
        let limiter = Limiter::new(options).unwrap();
        limiter.submit(sleeper("kept", 1)).unwrap();

        let err = limiter.submit(sleeper("rejected", 1)).unwrap_err();
        assert!(matches!(err, PacerError::Scheduling(_)));
        assert!(limiter.schedule(sleeper("also-rejected", 1)).is_none());
    }

    #[tokio::test]
    async fn leaked_job_completes_as_cancelled() {
        let options = LimiterOptions {
            auto_start: false,
            queue: QueueOptions {
                high_water: Some(1),
                ..QueueOptions::default()
            },
            ..LimiterOptions::default()
        };
        let limiter = Limiter::new(options).unwrap();
        let evicted = limiter.submit(sleeper("old", 1)).unwrap();
        let kept = limiter.submit(sleeper("new", 1)).unwrap();

        assert_eq!(evicted.await.unwrap().status(), TaskStatus::Cancelled);
        limiter.start();
        assert!(kept.await.unwrap().is_success());
    }

    #[tokio::test]
    async fn delay_spaces_out_starts() {
        let options = LimiterOptions {
            concurrency: UNBOUNDED,
            delay_ms: 30,
            ..LimiterOptions::default()
        };
        let limiter = Limiter::new(options).unwrap();
        let started = tokio::time::Instant::now();
        let completions: Vec<_> = (0..3)
            .map(|i| limiter.submit(sleeper(&format!("d{i}"), 1)).unwrap())
            .collect();
        for completion in completions {
            completion.await.unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn piped_jobs_run_through_downstream() {
        let upstream = Limiter::new(LimiterOptions::with_concurrency(4)).unwrap();
        let downstream = Limiter::new(LimiterOptions::with_concurrency(1)).unwrap();
        upstream.pipe(&downstream).unwrap();
        let mut downstream_events = downstream.subscribe();

        let value = upstream.execute(sleeper("piped", 1)).await.unwrap();
        assert_eq!(value, json!(1));

        let done = loop {
            if let LimiterEvent::Done(done) = downstream_events.recv().await.unwrap() {
                break done;
            }
        };
        assert_eq!(done.task_id(), "piped");
    }

    #[tokio::test]
    async fn pipe_cycles_are_rejected() {
        let a = Limiter::new(LimiterOptions::default()).unwrap();
        let b = Limiter::new(LimiterOptions::default()).unwrap();
        a.pipe(&b).unwrap();

        assert!(b.pipe(&a).is_err());
        assert!(a.pipe(&a).is_err());
    }

    #[tokio::test]
    async fn wait_until_empty_resolves_after_last_job() {
        let limiter = Limiter::new(LimiterOptions::with_concurrency(2)).unwrap();
        for i in 0..4 {
            limiter.schedule(sleeper(&format!("w{i}"), 10)).unwrap();
        }
        limiter.wait_until_empty().await;

        assert_eq!(limiter.size(), 0);
        assert_eq!(limiter.in_flight(), 0);
    }
}
