//! Team runtime
//!
//! An OpenMP-style tasking runtime: a fixed team of workers, per-worker deques
//! with stealing, and the `__kmpc`-shaped primitives exposed through
//! [`TeamRuntime`]. The calling thread joins the team as gtid 0 for the
//! duration of [`Team::parallel`]; the other members are pool threads.
//!
//! Join semantics follow `taskwait`: a thread waits for the direct children of
//! the task it is currently executing, and runs other queued tasks meanwhile.

pub mod queue;
pub mod task;
pub mod work_stealer;

#[cfg(test)]
mod tests;

pub use queue::TaskQueue;
pub use task::{TaskId, TaskNode, TaskRef};
pub use work_stealer::{StealStats, StealStrategy, WorkStealer};

use std::cell::RefCell;
use std::ffi::c_int;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::abi::kmp::{Ident, KmpRoutineEntry, KmpTask, TASK_TIED};
use crate::runtime::KmpRuntime;
use crate::util::config::{self, PoolConfig};
use crate::util::error::{ChildPanic, RtsError};

/// Team configuration.
#[derive(Debug, Clone)]
pub struct TeamConfig {
    /// Number of team members, including the thread that calls `parallel`.
    pub num_workers: usize,
    /// Upper bound on tasks moved per steal.
    pub steal_batch: usize,
    /// Idle timeout before re-checking the deques.
    pub idle_timeout: Duration,
    /// End of a victim deque to steal from.
    pub strategy: StealStrategy,
}

impl Default for TeamConfig {
    fn default() -> Self {
        Self::from(&config::global().pool)
    }
}

impl From<&PoolConfig> for TeamConfig {
    fn from(pool: &PoolConfig) -> Self {
        Self {
            num_workers: pool.resolved_workers(),
            steal_batch: pool.steal_batch,
            idle_timeout: pool.idle_timeout(),
            strategy: StealStrategy::default(),
        }
    }
}

impl TeamConfig {
    /// Defaults with an explicit team size (0 keeps the configured size).
    pub fn with_workers(num_workers: usize) -> Self {
        let mut config = Self::default();
        if num_workers > 0 {
            config.num_workers = num_workers;
        }
        config
    }
}

/// Team statistics.
#[derive(Debug, Default)]
pub struct TeamStats {
    /// Descriptors handed out by `task_alloc`.
    pub tasks_allocated: AtomicUsize,
    /// Descriptors submitted.
    pub tasks_scheduled: AtomicUsize,
    /// Tasks whose routine returned or unwound.
    pub tasks_completed: AtomicUsize,
    /// Tasks whose routine unwound.
    pub tasks_failed: AtomicUsize,
    /// `taskwait` calls.
    pub taskwaits: AtomicUsize,
    /// Peak number of submitted, unfinished tasks.
    pub peak_outstanding: AtomicUsize,
}

impl TeamStats {
    #[inline]
    fn record_allocated(&self) {
        self.tasks_allocated.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_scheduled(
        &self,
        outstanding: usize,
    ) {
        self.tasks_scheduled.fetch_add(1, Ordering::Relaxed);
        self.peak_outstanding
            .fetch_max(outstanding, Ordering::Relaxed);
    }

    #[inline]
    fn record_completed(
        &self,
        failed: bool,
    ) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.tasks_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    fn record_taskwait(&self) {
        self.taskwaits.fetch_add(1, Ordering::Relaxed);
    }
}

/// State shared by all members of a team.
#[derive(Debug)]
struct TeamShared {
    config: TeamConfig,
    stealer: WorkStealer,
    running: AtomicBool,
    /// Submitted tasks not yet finished, across the whole team.
    outstanding: AtomicUsize,
    sleepers: AtomicUsize,
    sleep_lock: Mutex<()>,
    wake: Condvar,
    stats: TeamStats,
    next_task_id: AtomicUsize,
}

impl TeamShared {
    fn new(config: TeamConfig) -> Self {
        Self {
            stealer: WorkStealer::with_strategy(config.num_workers, config.strategy),
            config,
            running: AtomicBool::new(true),
            outstanding: AtomicUsize::new(0),
            sleepers: AtomicUsize::new(0),
            sleep_lock: Mutex::new(()),
            wake: Condvar::new(),
            stats: TeamStats::default(),
            next_task_id: AtomicUsize::new(0),
        }
    }

    fn submit(
        &self,
        gtid: usize,
        task: TaskRef,
    ) {
        if task.flags() & TASK_TIED == 0 {
            trace!(gtid, task = %task.id(), "untied task scheduled as tied");
        }
        task.parent().add_child();
        let outstanding = self.outstanding.fetch_add(1, Ordering::AcqRel) + 1;
        self.stats.record_scheduled(outstanding);
        trace!(gtid, task = %task.id(), "submit");
        self.stealer.push(gtid, task);
        self.notify(false);
    }

    #[inline]
    fn find_task(
        &self,
        gtid: usize,
    ) -> Option<TaskRef> {
        self.stealer
            .pop_local(gtid)
            .or_else(|| self.stealer.steal(gtid, self.config.steal_batch))
    }

    fn execute(
        &self,
        gtid: usize,
        task: TaskRef,
    ) {
        let id = task.id();
        let outer = swap_current_task(Arc::new(TaskNode::new()));
        let (parent, result) = task.invoke(gtid as c_int);
        if let Some(outer) = outer {
            swap_current_task(outer);
        }

        let failed = result.is_err();
        if let Err(payload) = result {
            let failure = ChildPanic::new(payload);
            trace!(gtid, task = %id, "task unwound: {}", failure);
            parent.record_failure(failure);
        }
        let last_child = parent.complete_child();
        drop(parent);

        self.stats.record_completed(failed);
        let drained = self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1;
        if last_child || drained {
            self.notify(true);
        }
    }

    /// Run tasks until `done` holds, parking when there is nothing to run.
    fn help_until(
        &self,
        gtid: usize,
        done: impl Fn() -> bool,
    ) {
        let backoff = Backoff::new();
        while !done() {
            if let Some(task) = self.find_task(gtid) {
                self.execute(gtid, task);
                backoff.reset();
            } else if backoff.is_completed() {
                self.park(|| !done() && self.stealer.is_empty());
            } else {
                backoff.snooze();
            }
        }
    }

    fn wait_children(
        &self,
        gtid: usize,
        node: &TaskNode,
    ) -> Result<(), ChildPanic> {
        self.help_until(gtid, || node.pending() == 0);
        node.take_failure().map_or(Ok(()), Err)
    }

    fn park(
        &self,
        still_idle: impl Fn() -> bool,
    ) {
        let mut guard = self.sleep_lock.lock();
        self.sleepers.fetch_add(1, Ordering::SeqCst);
        if still_idle() {
            self.wake.wait_for(&mut guard, self.config.idle_timeout);
        }
        self.sleepers.fetch_sub(1, Ordering::SeqCst);
    }

    fn notify(
        &self,
        all: bool,
    ) {
        if self.sleepers.load(Ordering::SeqCst) == 0 {
            return;
        }
        let _guard = self.sleep_lock.lock();
        if all {
            self.wake.notify_all();
        } else {
            self.wake.notify_one();
        }
    }
}

/// Per-thread membership in a team.
#[derive(Debug, Clone)]
struct WorkerCtx {
    shared: Arc<TeamShared>,
    gtid: usize,
    /// Join counter of the task this thread is executing.
    task: Arc<TaskNode>,
}

thread_local! {
    static CURRENT: RefCell<Option<WorkerCtx>> = const { RefCell::new(None) };
}

fn current() -> Option<WorkerCtx> {
    CURRENT.with(|c| c.borrow().clone())
}

fn install_ctx(ctx: Option<WorkerCtx>) -> Option<WorkerCtx> {
    CURRENT.with(|c| c.replace(ctx))
}

fn swap_current_task(task: Arc<TaskNode>) -> Option<Arc<TaskNode>> {
    CURRENT.with(|c| {
        c.borrow_mut()
            .as_mut()
            .map(|ctx| mem::replace(&mut ctx.task, task))
    })
}

fn expect_ctx(gtid: c_int) -> WorkerCtx {
    match current() {
        Some(ctx) => {
            debug_assert_eq!(
                ctx.gtid as c_int, gtid,
                "gtid does not belong to the calling thread"
            );
            ctx
        },
        None => panic!("tasking runtime entered outside a team (gtid {})", gtid),
    }
}

fn worker_loop(
    shared: Arc<TeamShared>,
    gtid: usize,
) {
    install_ctx(Some(WorkerCtx {
        shared: shared.clone(),
        gtid,
        task: Arc::new(TaskNode::new()),
    }));
    trace!(gtid, "worker online");

    shared.help_until(gtid, || !shared.running.load(Ordering::Acquire));

    install_ctx(None);
    trace!(gtid, "worker offline");
}

/// A fixed-size team of workers.
#[derive(Debug)]
pub struct Team {
    shared: Arc<TeamShared>,
    workers: Vec<thread::JoinHandle<()>>,
    /// Serializes `parallel` regions entered from different threads.
    master: Mutex<()>,
}

impl Team {
    /// Start a team with the given configuration.
    pub fn new(mut config: TeamConfig) -> Result<Self, RtsError> {
        config.num_workers = config.num_workers.max(1);
        let num_workers = config.num_workers;

        let mut team = Self {
            shared: Arc::new(TeamShared::new(config)),
            workers: Vec::with_capacity(num_workers - 1),
            master: Mutex::new(()),
        };

        for gtid in 1..num_workers {
            let shared = team.shared.clone();
            let worker = thread::Builder::new()
                .name(format!("rts-worker-{}", gtid))
                .spawn(move || worker_loop(shared, gtid))
                .map_err(|e| RtsError::PoolBuild(e.to_string()))?;
            team.workers.push(worker);
        }

        debug!("team started with {} workers", num_workers);
        Ok(team)
    }

    /// Start a team of `num_workers` with otherwise default settings.
    #[inline]
    pub fn with_workers(num_workers: usize) -> Result<Self, RtsError> {
        Self::new(TeamConfig::with_workers(num_workers))
    }

    /// Team size, including the master.
    #[inline]
    pub fn num_workers(&self) -> usize {
        self.shared.config.num_workers
    }

    /// Get statistics.
    #[inline]
    pub fn stats(&self) -> &TeamStats {
        &self.shared.stats
    }

    /// Check if the team is running.
    #[inline]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Run `f` on the calling thread as gtid 0 of this team.
    ///
    /// Returns after `f` and every task submitted in the team have finished.
    /// A child failure that no `taskwait` observed is resumed here. Calling
    /// `parallel` from inside a region of the same team runs `f` directly.
    pub fn parallel<R>(
        &self,
        f: impl FnOnce() -> R,
    ) -> R {
        if let Some(ctx) = current() {
            if Arc::ptr_eq(&ctx.shared, &self.shared) {
                return f();
            }
        }

        let _master = self.master.lock();
        let root = Arc::new(TaskNode::new());
        let outer = install_ctx(Some(WorkerCtx {
            shared: self.shared.clone(),
            gtid: 0,
            task: root.clone(),
        }));

        let result = panic::catch_unwind(AssertUnwindSafe(f));
        self.shared
            .help_until(0, || self.shared.outstanding.load(Ordering::Acquire) == 0);
        install_ctx(outer);

        let orphan = root.take_failure();
        match result {
            Ok(value) => {
                if let Some(failure) = orphan {
                    failure.resume();
                }
                value
            },
            Err(payload) => {
                if let Some(failure) = orphan {
                    warn!("dropping unjoined child failure: {}", failure);
                }
                panic::resume_unwind(payload)
            },
        }
    }

    /// Stop and join the worker threads.
    pub fn shutdown(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.notify(true);

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("team worker exited by panic");
            }
        }
        let steals = self.shared.stealer.stats();
        debug!(
            tasks_stolen = steals.tasks_stolen.load(Ordering::Relaxed),
            success_rate = steals.success_rate(),
            "team stopped"
        );
    }
}

impl Drop for Team {
    fn drop(&mut self) {
        if self.is_running() {
            self.shutdown();
        }
    }
}

/// The `__kmpc` primitives served by the calling thread's [`Team`].
///
/// Outside any team, `global_thread_num` reports -1, `num_threads` 1 and
/// `thread_num` 0. The allocation, submission and wait entry points require
/// team membership and panic without it.
#[derive(Debug, Clone, Copy, Default)]
pub struct TeamRuntime;

impl KmpRuntime for TeamRuntime {
    #[inline]
    fn global_thread_num(_loc: &Ident) -> c_int {
        current().map_or(-1, |ctx| ctx.gtid as c_int)
    }

    unsafe fn task_alloc(
        _loc: &Ident,
        gtid: c_int,
        flags: c_int,
        sizeof_task: usize,
        sizeof_shareds: usize,
        entry: KmpRoutineEntry,
    ) -> *mut KmpTask {
        let ctx = expect_ctx(gtid);
        let id = TaskId(ctx.shared.next_task_id.fetch_add(1, Ordering::Relaxed));
        ctx.shared.stats.record_allocated();
        task::allocate(id, flags, ctx.task, sizeof_task, sizeof_shareds, entry).as_ptr()
    }

    unsafe fn task(
        _loc: &Ident,
        gtid: c_int,
        task: *mut KmpTask,
    ) -> c_int {
        let ctx = expect_ctx(gtid);
        let Some(task) = TaskRef::from_raw(task) else {
            panic!("null task descriptor submitted by gtid {}", gtid)
        };
        ctx.shared.submit(ctx.gtid, task);
        0
    }

    fn taskwait(
        _loc: &Ident,
        gtid: c_int,
    ) -> Result<(), ChildPanic> {
        let ctx = expect_ctx(gtid);
        ctx.shared.stats.record_taskwait();
        ctx.shared.wait_children(ctx.gtid, &ctx.task)
    }

    #[inline]
    fn num_threads() -> c_int {
        current().map_or(1, |ctx| ctx.shared.config.num_workers as c_int)
    }

    #[inline]
    fn thread_num() -> c_int {
        current().map_or(0, |ctx| ctx.gtid as c_int)
    }

    fn with_team<R: Send>(
        workers: usize,
        f: impl FnOnce() -> R + Send,
    ) -> Result<R, RtsError> {
        let team = Team::with_workers(workers)?;
        Ok(team.parallel(f))
    }
}
