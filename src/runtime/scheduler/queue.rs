//! Per-worker task deque
//!
//! The owning worker pushes and pops at the back (depth-first, most recently
//! spawned first); thieves take from the front, where the oldest and usually
//! largest tasks sit.

use std::collections::VecDeque;

use parking_lot::Mutex;

use super::task::TaskRef;

/// A thread-safe deque of submitted descriptors.
#[derive(Debug, Default)]
pub struct TaskQueue {
    inner: Mutex<VecDeque<TaskRef>>,
}

impl TaskQueue {
    /// Create a new empty task queue.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a task to the back of the queue.
    #[inline]
    pub fn push(
        &self,
        task: TaskRef,
    ) {
        self.inner.lock().push_back(task);
    }

    /// Pop the most recently pushed task (owner side).
    #[inline]
    pub fn pop_back(&self) -> Option<TaskRef> {
        self.inner.lock().pop_back()
    }

    /// Take up to `max` of the oldest tasks in one lock acquisition.
    pub fn steal_front(
        &self,
        max: usize,
    ) -> Vec<TaskRef> {
        let mut inner = self.inner.lock();
        let count = max.min(inner.len());
        inner.drain(..count).collect()
    }

    /// Take up to `max` of the newest tasks in one lock acquisition.
    pub fn steal_back(
        &self,
        max: usize,
    ) -> Vec<TaskRef> {
        let mut inner = self.inner.lock();
        let keep = inner.len().saturating_sub(max);
        inner.split_off(keep).into_iter().collect()
    }

    /// Get the number of tasks in the queue.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Check if the queue is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
