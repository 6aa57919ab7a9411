//! Work stealing across the team's worker deques.
//!
//! Each worker owns one [`TaskQueue`]. A worker with an empty deque sweeps the
//! others starting from a pseudo-random victim and moves a small batch to its
//! own deque.

use std::sync::atomic::{AtomicUsize, Ordering};

use super::queue::TaskQueue;
use super::task::TaskRef;

/// Statistics about work stealing operations.
#[derive(Debug, Default)]
pub struct StealStats {
    /// Number of successful steals.
    pub steal_successes: AtomicUsize,
    /// Number of failed steal attempts.
    pub steal_failures: AtomicUsize,
    /// Total tasks stolen.
    pub tasks_stolen: AtomicUsize,
}

impl StealStats {
    /// Record a successful steal.
    #[inline]
    pub fn record_success(
        &self,
        count: usize,
    ) {
        self.steal_successes.fetch_add(1, Ordering::Relaxed);
        self.tasks_stolen.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a failed steal attempt.
    #[inline]
    pub fn record_failure(&self) {
        self.steal_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get success rate.
    pub fn success_rate(&self) -> f64 {
        let successes = self.steal_successes.load(Ordering::Relaxed);
        let total = successes + self.steal_failures.load(Ordering::Relaxed);
        if total == 0 {
            return 1.0;
        }
        successes as f64 / total as f64
    }
}

/// End of the victim's deque that thieves take from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StealStrategy {
    /// Oldest tasks first (FIFO with respect to the victim).
    #[default]
    Front,
    /// Newest tasks first.
    Back,
}

/// The team's deques plus steal bookkeeping.
#[derive(Debug)]
pub struct WorkStealer {
    queues: Vec<TaskQueue>,
    strategy: StealStrategy,
    stats: StealStats,
    /// Tasks sitting in any deque.
    queued: AtomicUsize,
    rng_state: AtomicUsize,
}

impl WorkStealer {
    /// Create deques for `num_workers` workers.
    pub fn new(num_workers: usize) -> Self {
        Self::with_strategy(num_workers, StealStrategy::default())
    }

    /// Create deques with an explicit steal strategy.
    pub fn with_strategy(
        num_workers: usize,
        strategy: StealStrategy,
    ) -> Self {
        Self {
            queues: (0..num_workers.max(1)).map(|_| TaskQueue::new()).collect(),
            strategy,
            stats: StealStats::default(),
            queued: AtomicUsize::new(0),
            rng_state: AtomicUsize::new(1),
        }
    }

    /// Get the number of workers.
    #[inline]
    pub fn num_workers(&self) -> usize {
        self.queues.len()
    }

    /// Push onto a worker's own deque.
    #[inline]
    pub fn push(
        &self,
        worker: usize,
        task: TaskRef,
    ) {
        self.queued.fetch_add(1, Ordering::SeqCst);
        self.queues[worker].push(task);
    }

    /// Pop from a worker's own deque.
    #[inline]
    pub fn pop_local(
        &self,
        worker: usize,
    ) -> Option<TaskRef> {
        let task = self.queues[worker].pop_back();
        if task.is_some() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
        }
        task
    }

    /// Steal up to `batch` tasks for `thief`.
    ///
    /// The first stolen task is returned; the rest go to the thief's deque.
    pub fn steal(
        &self,
        thief: usize,
        batch: usize,
    ) -> Option<TaskRef> {
        let num_workers = self.num_workers();
        if num_workers < 2 || self.is_empty() {
            return None;
        }

        let start = self.next_rand() % num_workers;
        for step in 0..num_workers {
            let victim = (start + step) % num_workers;
            if victim == thief {
                continue;
            }

            let queue = &self.queues[victim];
            let mut stolen = match self.strategy {
                StealStrategy::Front => queue.steal_front(batch.max(1)),
                StealStrategy::Back => queue.steal_back(batch.max(1)),
            }
            .into_iter();

            if let Some(first) = stolen.next() {
                let count = 1 + stolen.len();
                self.queued.fetch_sub(1, Ordering::SeqCst);
                // Moved tasks stay counted in `queued`.
                for task in stolen {
                    self.queues[thief].push(task);
                }
                self.stats.record_success(count);
                return Some(first);
            }
        }

        self.stats.record_failure();
        None
    }

    /// Whether every deque is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queued.load(Ordering::SeqCst) == 0
    }

    /// Get steal statistics.
    #[inline]
    pub fn stats(&self) -> &StealStats {
        &self.stats
    }

    /// Simple LCG random number generator.
    #[inline]
    fn next_rand(&self) -> usize {
        let state = self.rng_state.fetch_add(1, Ordering::Relaxed);
        state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407)
            >> 16
    }
}
