//! Task runtimes the adapters drive
//!
//! - [`scheduler`]: an OpenMP-style team runtime serving the `__kmpc` primitives
//! - [`group`]: a task-group runtime on top of rayon's pool
//! - `libomp` (feature `libomp`): the same primitives bound to the system libomp
//!
//! [`KmpRuntime`] is the boundary the tasking adapter is written against. Every
//! item is an associated function so the adapter dispatches statically.

pub mod group;
#[cfg(feature = "libomp")]
pub mod libomp;
pub mod scheduler;

pub use group::TaskGroup;
#[cfg(feature = "libomp")]
pub use libomp::LibOmp;
pub use scheduler::{Team, TeamConfig, TeamRuntime};

use std::ffi::c_int;

use crate::abi::kmp::{Ident, KmpRoutineEntry, KmpTask};
use crate::util::error::{ChildPanic, RtsError};

/// Entry points of an OpenMP tasking runtime.
pub trait KmpRuntime: 'static {
    /// Whether a Rust unwind may pass through this runtime's own frames. When
    /// false, task routines stop a panic at their boundary and abort.
    const CARRIES_UNWIND: bool = true;

    /// `__kmpc_global_thread_num`: the caller's logical thread id, negative
    /// when the caller is not attached to the runtime.
    fn global_thread_num(loc: &Ident) -> c_int;

    /// `__kmpc_omp_task_alloc`: allocate a descriptor of `sizeof_task` bytes
    /// whose payload region has at least `sizeof_shareds` usable bytes.
    ///
    /// The descriptor belongs to the caller until it is handed to
    /// [`KmpRuntime::task`], which transfers it to the runtime. There is no
    /// separate free: a descriptor that is allocated and never submitted leaks.
    ///
    /// # Safety
    ///
    /// `gtid` must be the caller's id from `global_thread_num`.
    unsafe fn task_alloc(
        loc: &Ident,
        gtid: c_int,
        flags: c_int,
        sizeof_task: usize,
        sizeof_shareds: usize,
        entry: KmpRoutineEntry,
    ) -> *mut KmpTask;

    /// `__kmpc_omp_task`: enqueue an allocated descriptor.
    ///
    /// # Safety
    ///
    /// `task` must come from `task_alloc` on this thread and not be submitted twice.
    unsafe fn task(
        loc: &Ident,
        gtid: c_int,
        task: *mut KmpTask,
    ) -> c_int;

    /// `__kmpc_omp_taskwait`: block until the current task's children finish.
    fn taskwait(
        loc: &Ident,
        gtid: c_int,
    ) -> Result<(), ChildPanic>;

    /// `omp_get_num_threads`.
    fn num_threads() -> c_int;

    /// `omp_get_thread_num`.
    fn thread_num() -> c_int;

    /// Run `f` on the calling thread inside a team of `workers` threads
    /// (0 means the configured default).
    fn with_team<R: Send>(
        workers: usize,
        f: impl FnOnce() -> R + Send,
    ) -> Result<R, RtsError>;
}
