//! Priority-ordered job container.
//!
//! Jobs are kept sorted by descending priority; jobs with equal priority keep
//! their insertion order. The head is always the next job to run, the tail
//! the first candidate for eviction.

use std::collections::VecDeque;

use crate::domain::JobId;

/// One queued unit of work.
#[derive(Debug)]
pub struct Job<T> {
    pub uuid: JobId,
    /// Higher runs first.
    pub priority: i32,
    /// Tokens consumed from the bucket on dequeue.
    pub weight: u32,
    seq: u64,
    pub payload: T,
}

impl<T> Job<T> {
    pub fn new(payload: T) -> Self {
        Self {
            uuid: JobId::generate(),
            priority: 0,
            weight: 1,
            seq: 0,
            payload,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Insertion sequence number assigned by the queue.
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

#[derive(Debug)]
pub struct PriorityQueue<T> {
    jobs: VecDeque<Job<T>>,
    next_seq: u64,
}

impl<T> PriorityQueue<T> {
    pub fn new() -> Self {
        Self {
            jobs: VecDeque::new(),
            next_seq: 0,
        }
    }

    /// Insert after every job whose priority is greater than or equal to
    /// the new one.
    pub fn push(&mut self, mut job: Job<T>) {
        job.seq = self.next_seq;
        self.next_seq += 1;

        match self.jobs.back() {
            None => self.jobs.push_back(job),
            Some(tail) if tail.priority >= job.priority => self.jobs.push_back(job),
            Some(_) => {
                let idx = self.jobs.partition_point(|queued| queued.priority >= job.priority);
                self.jobs.insert(idx, job);
            }
        }
    }

    pub fn peek(&self) -> Option<&Job<T>> {
        self.jobs.front()
    }

    /// Remove the head.
    pub fn shift(&mut self) -> Option<Job<T>> {
        self.jobs.pop_front()
    }

    pub fn remove(&mut self, uuid: JobId) -> Option<Job<T>> {
        let idx = self.jobs.iter().position(|job| job.uuid == uuid)?;
        self.jobs.remove(idx)
    }

    pub fn clear(&mut self) -> Vec<Job<T>> {
        self.jobs.drain(..).collect()
    }

    /// Remove the earliest-queued job with `priority <= threshold - 1`, or,
    /// without a threshold, the earliest-queued job at the lowest priority.
    pub fn drop_by_priority(&mut self, threshold: Option<i32>) -> Option<Job<T>> {
        let limit = match threshold {
            Some(threshold) => threshold.checked_sub(1)?,
            None => self.jobs.back()?.priority,
        };
        let start = self.jobs.partition_point(|job| job.priority > limit);
        let idx = self
            .jobs
            .iter()
            .enumerate()
            .skip(start)
            .min_by_key(|(_, job)| job.seq)
            .map(|(idx, _)| idx)?;
        self.jobs.remove(idx)
    }

    pub fn min_priority(&self) -> Option<i32> {
        self.jobs.back().map(|job| job.priority)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job<T>> {
        self.jobs.iter()
    }
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn drain(queue: &mut PriorityQueue<&'static str>) -> Vec<&'static str> {
        std::iter::from_fn(|| queue.shift().map(|job| job.payload)).collect()
    }

    #[test]
    fn higher_priority_dequeues_first() {
        let mut queue = PriorityQueue::new();
        queue.push(Job::new("low").with_priority(-1));
        queue.push(Job::new("normal"));
        queue.push(Job::new("high").with_priority(5));

        assert_eq!(drain(&mut queue), vec!["high", "normal", "low"]);
    }

    #[test]
    fn equal_priority_is_fifo() {
        let mut queue = PriorityQueue::new();
        queue.push(Job::new("a").with_priority(1));
        queue.push(Job::new("b").with_priority(2));
        queue.push(Job::new("c").with_priority(1));
        queue.push(Job::new("d").with_priority(2));

        assert_eq!(drain(&mut queue), vec!["b", "d", "a", "c"]);
    }

    #[test]
    fn random_priorities_dequeue_non_increasing_and_stable() {
        let mut rng = rand::thread_rng();
        let mut queue = PriorityQueue::new();
        for i in 0..500u32 {
            queue.push(Job::new(i).with_priority(rng.gen_range(-3..=3)));
        }

        let order: Vec<Job<u32>> = std::iter::from_fn(|| queue.shift()).collect();
        for pair in order.windows(2) {
            assert!(pair[0].priority >= pair[1].priority);
            if pair[0].priority == pair[1].priority {
                assert!(pair[0].seq() < pair[1].seq());
            }
        }
    }

    #[test]
    fn drop_without_threshold_takes_oldest_lowest() {
        let mut queue = PriorityQueue::new();
        queue.push(Job::new("low-1").with_priority(0));
        queue.push(Job::new("high").with_priority(3));
        queue.push(Job::new("low-2").with_priority(0));

        let dropped = queue.drop_by_priority(None).unwrap();
        assert_eq!(dropped.payload, "low-1");
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn drop_with_threshold_takes_oldest_below_it() {
        let mut queue = PriorityQueue::new();
        queue.push(Job::new("one").with_priority(1));
        queue.push(Job::new("zero").with_priority(0));
        queue.push(Job::new("two").with_priority(2));

        // candidates: priority <= 1 -> "one" (seq 0) and "zero" (seq 1)
        let dropped = queue.drop_by_priority(Some(2)).unwrap();
        assert_eq!(dropped.payload, "one");

        assert!(queue.drop_by_priority(Some(0)).is_none());
    }

    #[test]
    fn remove_by_uuid() {
        let mut queue = PriorityQueue::new();
        let job = Job::new("target");
        let uuid = job.uuid;
        queue.push(Job::new("other"));
        queue.push(job);

        assert_eq!(queue.remove(uuid).unwrap().payload, "target");
        assert!(queue.remove(uuid).is_none());
        assert_eq!(queue.len(), 1);
    }
}
