//! Bounded priority queue with overflow strategies and a token bucket.
//!
//! # 受け入れ判定の順序
//! 1. `blocked` 中はすべて拒否
//! 2. バケット有効時、`weight > bucketSize` のジョブは拒否（永遠に開始できないため）
//! 3. `highWater` に達していれば strategy を適用
//!    - `overflow`: 新しいジョブを拒否
//!    - `leak`: 最低優先度のうち最も古いジョブを追い出してから受け入れ
//!    - `overflow-priority`: 新しいジョブより厳密に低い優先度のジョブを追い出す。なければ拒否
//!    - `block`: キューを空にして拒否し、`penalty` の間 `blocked` にする
//!
//! 追い出された（evicted）ジョブは `Admission` で呼び出し側に返されます。
//! キュー自身はジョブを捨てるだけで、完了通知は持ち主（Limiter）の責務です。
//!
//! # タイマー
//! refill タイマーと penalty タイマーは Tokio タスクとして spawn され、
//! どちらも状態を `Weak` で参照します。キューを drop すると refill タスクは abort されます。

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::bucket::TokenBucket;
use super::options::{QueueOptions, Strategy};
use super::priority::{Job, PriorityQueue};
use crate::domain::JobId;
use crate::error::ValidationError;
use crate::sync::lock;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// The `block` strategy tripped; every enqueue is rejected until `Unblocked`.
    Blocked,
    Unblocked,
    /// The bucket level changed on a refill tick.
    Refill { level: u32 },
}

/// Result of an enqueue.
#[derive(Debug)]
pub struct Admission<T> {
    pub accepted: bool,
    /// The offered job, handed back when not accepted.
    pub rejected: Option<Job<T>>,
    /// Jobs removed to make room (or cleared by `block`).
    pub evicted: Vec<Job<T>>,
}

impl<T> Admission<T> {
    fn accepted(evicted: Vec<Job<T>>) -> Self {
        Self {
            accepted: true,
            rejected: None,
            evicted,
        }
    }

    fn rejected(job: Job<T>, evicted: Vec<Job<T>>) -> Self {
        Self {
            accepted: false,
            rejected: Some(job),
            evicted,
        }
    }
}

struct QueueState<T> {
    jobs: PriorityQueue<T>,
    bucket: TokenBucket,
    blocked: bool,
}

/// Admission-controlled priority queue.
///
/// Must be created inside a Tokio runtime: the refill and penalty timers are
/// spawned on it. The refill timer stops when the queue is dropped.
pub struct AdmissionQueue<T> {
    options: QueueOptions,
    state: Arc<Mutex<QueueState<T>>>,
    events: broadcast::Sender<QueueEvent>,
    runtime: Handle,
    refill_task: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> AdmissionQueue<T> {
    pub fn new(options: QueueOptions) -> Result<Self, ValidationError> {
        options.validate()?;
        let runtime = Handle::try_current()
            .map_err(|_| ValidationError::new("the admission queue needs a Tokio runtime"))?;

        let bucket = if options.bucket_enabled() {
            TokenBucket::new(
                options.bucket_size,
                options.tokens_per_interval,
                options.interval(),
            )
        } else {
            TokenBucket::disabled()
        };
        let state = Arc::new(Mutex::new(QueueState {
            jobs: PriorityQueue::new(),
            bucket,
            blocked: false,
        }));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let refill_task = options.bucket_enabled().then(|| {
            runtime.spawn(refill_loop(
                Arc::downgrade(&state),
                events.clone(),
                options.interval(),
            ))
        });

        Ok(Self {
            options,
            state,
            events,
            runtime,
            refill_task,
        })
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Offer a job, applying the overflow strategy at `highWater`.
    pub fn enqueue(&self, job: Job<T>) -> Admission<T> {
        let mut state = lock(&self.state);

        if state.blocked {
            debug!(job = %job.uuid, "queue is blocked, rejecting job");
            return Admission::rejected(job, Vec::new());
        }
        if state.bucket.enabled() && job.weight > state.bucket.capacity() {
            warn!(
                job = %job.uuid,
                weight = job.weight,
                capacity = state.bucket.capacity(),
                "job weight exceeds bucket capacity, it could never start"
            );
            return Admission::rejected(job, Vec::new());
        }

        let mut evicted = Vec::new();
        if let Some(high_water) = self.options.high_water
            && state.jobs.len() >= high_water
        {
            match self.options.strategy {
                Strategy::Overflow => return Admission::rejected(job, evicted),
                Strategy::Leak => evicted.extend(state.jobs.drop_by_priority(None)),
                Strategy::OverflowPriority => match state.jobs.drop_by_priority(Some(job.priority)) {
                    Some(dropped) => evicted.push(dropped),
                    None => return Admission::rejected(job, evicted),
                },
                Strategy::Block => {
                    evicted = state.jobs.clear();
                    state.blocked = true;
                    drop(state);

                    warn!(
                        cleared = evicted.len(),
                        penalty_ms = self.options.penalty_ms,
                        "high water reached, blocking the queue"
                    );
                    let _ = self.events.send(QueueEvent::Blocked);
                    self.spawn_penalty_timer();
                    return Admission::rejected(job, evicted);
                }
            }
            debug!(
                strategy = %self.options.strategy,
                evicted = evicted.len(),
                "high water reached"
            );
        }

        state.jobs.push(job);
        Admission::accepted(evicted)
    }

    /// Pop the head if the bucket holds enough tokens for its weight.
    pub fn dequeue(&self) -> Option<Job<T>> {
        let mut state = lock(&self.state);
        let weight = state.jobs.peek()?.weight;
        if !state.bucket.try_take(weight) {
            return None;
        }
        state.jobs.shift()
    }

    pub fn drop_by_priority(&self, threshold: Option<i32>) -> Option<Job<T>> {
        lock(&self.state).jobs.drop_by_priority(threshold)
    }

    pub fn remove(&self, uuid: JobId) -> Option<Job<T>> {
        lock(&self.state).jobs.remove(uuid)
    }

    pub fn clear(&self) -> Vec<Job<T>> {
        lock(&self.state).jobs.clear()
    }

    /// Apply one refill outside the timer. Emits `Refill` when the level changed.
    pub fn refill(&self) -> bool {
        refill_once(&self.state, &self.events)
    }

    pub fn size(&self) -> usize {
        lock(&self.state).jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn is_blocked(&self) -> bool {
        lock(&self.state).blocked
    }

    /// Current token level, `None` when the bucket is disabled.
    pub fn bucket_level(&self) -> Option<u32> {
        let state = lock(&self.state);
        state.bucket.enabled().then(|| state.bucket.level())
    }

    fn spawn_penalty_timer(&self) {
        let state = Arc::downgrade(&self.state);
        let events = self.events.clone();
        let penalty = self.options.penalty();
        self.runtime.spawn(async move {
            tokio::time::sleep(penalty).await;
            let Some(state) = state.upgrade() else {
                return;
            };
            lock(&state).blocked = false;
            debug!("penalty elapsed, unblocking the queue");
            let _ = events.send(QueueEvent::Unblocked);
        });
    }
}

impl<T> Drop for AdmissionQueue<T> {
    fn drop(&mut self) {
        if let Some(task) = self.refill_task.take() {
            task.abort();
        }
    }
}

fn refill_once<T>(state: &Mutex<QueueState<T>>, events: &broadcast::Sender<QueueEvent>) -> bool {
    let level = {
        let mut state = lock(state);
        state.bucket.refill().then(|| state.bucket.level())
    };
    match level {
        Some(level) => {
            let _ = events.send(QueueEvent::Refill { level });
            true
        }
        None => false,
    }
}

async fn refill_loop<T>(
    state: Weak<Mutex<QueueState<T>>>,
    events: broadcast::Sender<QueueEvent>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(state) = state.upgrade() else {
            break;
        };
        refill_once(&state, &events);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(options: QueueOptions) -> AdmissionQueue<&'static str> {
        AdmissionQueue::new(options).unwrap()
    }

    fn bounded(high_water: usize, strategy: Strategy) -> QueueOptions {
        QueueOptions {
            high_water: Some(high_water),
            strategy,
            penalty_ms: 50,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn overflow_rejects_at_high_water() {
        let queue = queue(bounded(2, Strategy::Overflow));
        assert!(queue.enqueue(Job::new("a")).accepted);
        assert!(queue.enqueue(Job::new("b")).accepted);

        let admission = queue.enqueue(Job::new("c"));
        assert!(!admission.accepted);
        assert_eq!(admission.rejected.unwrap().payload, "c");
        assert!(admission.evicted.is_empty());
        assert_eq!(queue.size(), 2);
    }

    #[tokio::test]
    async fn leak_always_admits() {
        let queue = queue(bounded(2, Strategy::Leak));
        queue.enqueue(Job::new("low").with_priority(-1));
        queue.enqueue(Job::new("high").with_priority(1));

        let admission = queue.enqueue(Job::new("new"));
        assert!(admission.accepted);
        assert_eq!(admission.evicted.len(), 1);
        assert_eq!(admission.evicted[0].payload, "low");
        assert_eq!(queue.size(), 2);
    }

    #[tokio::test]
    async fn overflow_priority_evicts_only_lower_priority() {
        let queue = queue(bounded(2, Strategy::OverflowPriority));
        queue.enqueue(Job::new("one").with_priority(1));
        queue.enqueue(Job::new("two").with_priority(2));

        let same = queue.enqueue(Job::new("also-one").with_priority(1));
        assert!(!same.accepted);

        let higher = queue.enqueue(Job::new("three").with_priority(3));
        assert!(higher.accepted);
        assert_eq!(higher.evicted[0].payload, "one");

        let order: Vec<_> = std::iter::from_fn(|| queue.dequeue().map(|j| j.payload)).collect();
        assert_eq!(order, vec!["three", "two"]);
    }

    #[tokio::test]
    async fn block_clears_rejects_then_recovers() {
        let queue = queue(bounded(2, Strategy::Block));
        let mut events = queue.subscribe();
        queue.enqueue(Job::new("a"));
        queue.enqueue(Job::new("b"));

        let admission = queue.enqueue(Job::new("c"));
        assert!(!admission.accepted);
        assert_eq!(admission.evicted.len(), 2);
        assert_eq!(queue.size(), 0);
        assert!(queue.is_blocked());
        assert_eq!(events.recv().await.unwrap(), QueueEvent::Blocked);

        assert!(!queue.enqueue(Job::new("during-penalty")).accepted);

        assert_eq!(events.recv().await.unwrap(), QueueEvent::Unblocked);
        assert!(!queue.is_blocked());
        assert!(queue.enqueue(Job::new("after")).accepted);
    }

    #[tokio::test]
    async fn dequeue_waits_for_tokens() {
        let queue = queue(QueueOptions {
            bucket_size: 2,
            tokens_per_interval: 1,
            interval_ms: 30,
            ..Default::default()
        });
        let mut events = queue.subscribe();
        queue.enqueue(Job::new("heavy").with_weight(2));
        queue.enqueue(Job::new("light"));

        assert_eq!(queue.dequeue().unwrap().payload, "heavy");
        assert_eq!(queue.bucket_level(), Some(0));
        assert!(queue.dequeue().is_none());

        assert_eq!(events.recv().await.unwrap(), QueueEvent::Refill { level: 1 });
        assert_eq!(queue.dequeue().unwrap().payload, "light");
    }

    #[tokio::test]
    async fn overweight_job_is_rejected() {
        let queue = queue(QueueOptions {
            bucket_size: 2,
            ..Default::default()
        });
        assert!(!queue.enqueue(Job::new("too-heavy").with_weight(3)).accepted);
    }

    #[tokio::test]
    async fn manual_refill_reports_change() {
        let queue = queue(QueueOptions {
            bucket_size: 1,
            interval_ms: 60_000,
            ..Default::default()
        });
        assert!(!queue.refill());
        queue.enqueue(Job::new("a"));
        queue.dequeue().unwrap();
        assert!(queue.refill());
        assert_eq!(queue.bucket_level(), Some(1));
    }

    #[test]
    fn requires_runtime() {
        let err = AdmissionQueue::<()>::new(QueueOptions::default()).err().unwrap();
        assert!(err.message().contains("runtime"));
    }
}
