//! Bounded, priority-ordered scrape queue with rate-limited admission.
//!
//! Admission runs in two steps: the token bucket first, then the depth bound.
//! An incoming task that does not fit is dropped; tasks already queued are
//! never evicted to make room for it, whatever their priority.
//!
//! Dequeue order is strict priority (`Live` before `Imminent` before `Other`),
//! FIFO within a priority.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::resilience::TokenBucket;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Live,
    Imminent,
    Other,
}

impl Priority {
    const ALL: [Priority; 3] = [Priority::Live, Priority::Imminent, Priority::Other];

    fn index(self) -> usize {
        match self {
            Priority::Live => 0,
            Priority::Imminent => 1,
            Priority::Other => 2,
        }
    }
}

/// A unit of scheduled work. Immutable once enqueued.
#[derive(Debug, Clone, Serialize)]
pub struct ScrapeTask {
    pub match_id: String,
    pub url: String,
    pub priority: Priority,
    pub enqueue_time: DateTime<Utc>,
    /// Times this task was re-queued after a memory restart.
    pub restarts: u32,
}

/// Why a task was or was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Admission {
    Accepted,
    RateLimited,
    QueueFull,
    ShuttingDown,
    /// Refused before reaching the queue: malformed id or URL, or no
    /// adapter for the URL.
    Invalid,
}

impl Admission {
    pub fn is_accepted(self) -> bool {
        self == Admission::Accepted
    }
}

pub struct AsyncScheduler {
    max_queue_size: usize,
    rate_limiter: TokenBucket,
    queues: Mutex<[VecDeque<ScrapeTask>; 3]>,
    size: AtomicUsize,
    in_flight: AtomicUsize,
    shutdown: AtomicBool,
    task_ready: Notify,
    idle: Notify,
}

impl AsyncScheduler {
    pub fn new(max_queue_size: usize, rate_limit_burst: u32, tokens_per_sec: f64) -> Self {
        AsyncScheduler {
            max_queue_size,
            rate_limiter: TokenBucket::new(f64::from(rate_limit_burst), tokens_per_sec),
            queues: Mutex::new([VecDeque::new(), VecDeque::new(), VecDeque::new()]),
            size: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            task_ready: Notify::new(),
            idle: Notify::new(),
        }
    }

    /// Returns `true` when the task was admitted.
    pub fn enqueue(&self, match_id: &str, url: &str, priority: Priority) -> bool {
        self.admit(match_id, url, priority).is_accepted()
    }

    pub fn admit(&self, match_id: &str, url: &str, priority: Priority) -> Admission {
        if self.is_shutdown() {
            return Admission::ShuttingDown;
        }
        if !self.rate_limiter.consume(1.0) {
            debug!("Rate limited: dropping task for match {}", match_id);
            return Admission::RateLimited;
        }
        self.push(ScrapeTask {
            match_id: match_id.to_string(),
            url: url.to_string(),
            priority,
            enqueue_time: Utc::now(),
            restarts: 0,
        })
    }

    /// Put an already-admitted task back in line. Skips the rate limiter but
    /// not the queue bound.
    pub fn requeue(&self, task: ScrapeTask) -> Admission {
        if self.is_shutdown() {
            return Admission::ShuttingDown;
        }
        self.push(task)
    }

    fn push(&self, task: ScrapeTask) -> Admission {
        {
            let mut queues = self.lock_queues();
            if self.size.load(Ordering::SeqCst) >= self.max_queue_size {
                warn!(
                    "Queue full ({} tasks): dropping task for match {}",
                    self.max_queue_size, task.match_id
                );
                return Admission::QueueFull;
            }
            queues[task.priority.index()].push_back(task);
            self.size.fetch_add(1, Ordering::SeqCst);
        }

        self.task_ready.notify_one();
        Admission::Accepted
    }

    /// Wait for the next task. Returns `None` once the scheduler shuts down,
    /// including for callers already waiting.
    pub async fn next_task(&self) -> Option<ScrapeTask> {
        loop {
            let mut notified = pin!(self.task_ready.notified());
            notified.as_mut().enable();

            if self.is_shutdown() {
                return None;
            }
            if let Some(task) = self.try_dequeue() {
                return Some(task);
            }
            notified.await;
        }
    }

    /// Non-blocking dequeue; counts the task as in flight.
    pub fn try_dequeue(&self) -> Option<ScrapeTask> {
        let mut queues = self.lock_queues();
        for priority in Priority::ALL {
            if let Some(task) = queues[priority.index()].pop_front() {
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                self.size.fetch_sub(1, Ordering::SeqCst);
                return Some(task);
            }
        }
        None
    }

    /// Mark a dequeued task as finished.
    pub fn task_done(&self, task: &ScrapeTask) {
        let prev = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match prev {
            Ok(1) => self.idle.notify_waiters(),
            Ok(_) => {}
            Err(_) => warn!("task_done for match {} with nothing in flight", task.match_id),
        }
    }

    pub fn qsize(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_queue_size(&self) -> usize {
        self.max_queue_size
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Stop admitting tasks and release every `next_task` waiter. Queued tasks
    /// that never started are discarded.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let dropped = {
            let mut queues = self.lock_queues();
            let n: usize = queues.iter().map(VecDeque::len).sum();
            for q in queues.iter_mut() {
                q.clear();
            }
            self.size.store(0, Ordering::SeqCst);
            n
        };
        info!("Scheduler shut down ({} queued tasks discarded)", dropped);
        self.task_ready.notify_waiters();
    }

    /// Wait until no task is in flight. Returns `false` on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let mut idle = pin!(self.idle.notified());
                idle.as_mut().enable();
                if self.in_flight() == 0 {
                    return;
                }
                idle.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    fn lock_queues(&self) -> std::sync::MutexGuard<'_, [VecDeque<ScrapeTask>; 3]> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn scheduler(capacity: usize) -> AsyncScheduler {
        // Burst large enough that rate limiting never interferes.
        AsyncScheduler::new(capacity, 1000, 1000.0)
    }

    #[test]
    fn test_exactly_capacity_tasks_admitted() {
        let s = scheduler(3);
        let priorities = [Priority::Other, Priority::Live, Priority::Imminent];
        for (i, p) in priorities.iter().enumerate() {
            assert!(s.enqueue(&format!("m{}", i), "https://example.com", *p));
        }
        assert_eq!(
            s.admit("m3", "https://example.com", Priority::Live),
            Admission::QueueFull
        );
        assert_eq!(s.qsize(), 3);
    }

    #[tokio::test]
    async fn test_priority_then_fifo_order() {
        let s = scheduler(10);
        s.enqueue("a", "u", Priority::Imminent);
        s.enqueue("b", "u", Priority::Live);
        s.enqueue("c", "u", Priority::Imminent);

        let order: Vec<(String, Priority)> = vec![
            s.next_task().await.unwrap(),
            s.next_task().await.unwrap(),
            s.next_task().await.unwrap(),
        ]
        .into_iter()
        .map(|t| (t.match_id, t.priority))
        .collect();

        assert_eq!(
            order,
            vec![
                ("b".to_string(), Priority::Live),
                ("a".to_string(), Priority::Imminent),
                ("c".to_string(), Priority::Imminent),
            ]
        );
    }

    #[test]
    fn test_rate_limit_rejects_before_queue() {
        let s = AsyncScheduler::new(10, 2, 0.001);
        assert!(s.enqueue("a", "u", Priority::Live));
        assert!(s.enqueue("b", "u", Priority::Live));
        assert_eq!(s.admit("c", "u", Priority::Live), Admission::RateLimited);
        assert_eq!(s.qsize(), 2);
    }

    #[test]
    fn test_requeue_skips_rate_limit_but_not_bound() {
        let s = AsyncScheduler::new(2, 1, 0.001);
        assert!(s.enqueue("a", "u", Priority::Live));
        let mut task = s.try_dequeue().unwrap();
        task.restarts += 1;

        assert_eq!(s.admit("b", "u", Priority::Live), Admission::RateLimited);
        assert_eq!(s.requeue(task.clone()), Admission::Accepted);
        assert_eq!(s.requeue(task.clone()), Admission::Accepted);
        assert_eq!(s.requeue(task), Admission::QueueFull);
        assert_eq!(s.try_dequeue().unwrap().restarts, 1);

        s.shutdown();
        let again = ScrapeTask {
            match_id: "a".into(),
            url: "u".into(),
            priority: Priority::Live,
            enqueue_time: Utc::now(),
            restarts: 2,
        };
        assert_eq!(s.requeue(again), Admission::ShuttingDown);
    }

    #[tokio::test]
    async fn test_next_task_waits_for_enqueue() {
        let s = Arc::new(scheduler(10));
        let waiter = {
            let s = Arc::clone(&s);
            tokio::spawn(async move { s.next_task().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(s.enqueue("late", "u", Priority::Other));

        let task = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap()
            .expect("task expected");
        assert_eq!(task.match_id, "late");
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters_and_rejects() {
        let s = Arc::new(scheduler(10));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let s = Arc::clone(&s);
                tokio::spawn(async move { s.next_task().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        s.shutdown();
        for w in waiters {
            let res = tokio::time::timeout(Duration::from_secs(1), w)
                .await
                .expect("waiter released")
                .unwrap();
            assert!(res.is_none());
        }
        assert_eq!(s.admit("x", "u", Priority::Live), Admission::ShuttingDown);
    }

    #[tokio::test]
    async fn test_drain_waits_for_in_flight() {
        let s = Arc::new(scheduler(10));
        s.enqueue("a", "u", Priority::Live);
        let task = s.next_task().await.unwrap();
        assert_eq!(s.in_flight(), 1);

        assert!(!s.drain(Duration::from_millis(20)).await);

        let finisher = {
            let s = Arc::clone(&s);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                s.task_done(&task);
            })
        };
        assert!(s.drain(Duration::from_secs(1)).await);
        finisher.await.unwrap();
        assert_eq!(s.in_flight(), 0);
    }
}
