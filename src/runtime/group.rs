//! Task groups on top of rayon
//!
//! A [`TaskGroup`] collects closures submitted with `run` and joins them with
//! `wait`, in the manner of a TBB `task_group`. Work goes to whichever rayon
//! pool the caller is running in (the global pool otherwise). A wait issued
//! from a pool thread keeps that thread busy with other pool work; a wait from
//! outside the pool blocks.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex};
use rayon::Yield;
use tracing::error;

use crate::util::error::ChildPanic;

/// How long a pool thread with nothing to help with sleeps between checks.
const IDLE_WAIT: Duration = Duration::from_micros(100);

#[derive(Debug, Default)]
struct GroupState {
    pending: AtomicUsize,
    failure: Mutex<Option<ChildPanic>>,
    done_lock: Mutex<()>,
    done: Condvar,
}

impl GroupState {
    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.done_lock.lock();
            self.done.notify_all();
        }
    }

    fn record_failure(
        &self,
        failure: ChildPanic,
    ) {
        let mut slot = self.failure.lock();
        if slot.is_none() {
            *slot = Some(failure);
        }
    }
}

/// A set of submitted closures that can be joined together.
#[derive(Debug, Default)]
pub struct TaskGroup {
    state: Arc<GroupState>,
}

impl TaskGroup {
    /// Create an empty group.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit a closure. Returns without waiting for it to start.
    pub fn run<F>(
        &self,
        f: F,
    ) where
        F: FnOnce() + Send + 'static,
    {
        self.state.pending.fetch_add(1, Ordering::Relaxed);
        let state = self.state.clone();
        rayon::spawn(move || {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
                state.record_failure(ChildPanic::new(payload));
            }
            state.finish_one();
        });
    }

    /// Closures submitted and not yet finished.
    #[inline]
    pub fn pending(&self) -> usize {
        self.state.pending.load(Ordering::Acquire)
    }

    /// Block until every submitted closure has finished.
    ///
    /// Returns the first failure among them, if any. The group can be reused
    /// afterwards.
    pub fn wait(&self) -> Result<(), ChildPanic> {
        let backoff = Backoff::new();
        while self.pending() > 0 {
            match rayon::yield_now() {
                Some(Yield::Executed) => backoff.reset(),
                Some(Yield::Idle) => {
                    if backoff.is_completed() {
                        self.block(Some(IDLE_WAIT));
                    } else {
                        backoff.snooze();
                    }
                },
                None => self.block(None),
            }
        }
        self.state.failure.lock().take().map_or(Ok(()), Err)
    }

    fn block(
        &self,
        timeout: Option<Duration>,
    ) {
        let mut guard = self.state.done_lock.lock();
        while self.pending() > 0 {
            match timeout {
                Some(timeout) => {
                    self.state.done.wait_for(&mut guard, timeout);
                    return;
                },
                None => self.state.done.wait(&mut guard),
            }
        }
    }
}

impl Drop for TaskGroup {
    fn drop(&mut self) {
        if self.pending() > 0 {
            if let Err(failure) = self.wait() {
                error!("task group dropped with a failed task: {}", failure);
            }
        } else if let Some(failure) = self.state.failure.lock().take() {
            error!("task group dropped with an unobserved failure: {}", failure);
        }
    }
}
