//! OpenMP tasking adapter
//!
//! Maps the fork-join operations onto the `__kmpc` tasking primitives of a
//! [`KmpRuntime`]. The blob is packed into the descriptor's `shareds` region,
//! which is requested with `align` bytes of slack; the entry trampoline finds
//! it again with [`args_from_task`].
//!
//! The frame holds only the caller's gtid. The runtime owns task lifetimes,
//! so leaving a scope tears nothing down.

use std::ffi::{c_int, c_void};
use std::marker::PhantomData;
use std::mem::{offset_of, size_of};
use std::panic::{self, AssertUnwindSafe};

use tracing::{error, trace};

use super::{Backend, ChildBody};
use crate::abi::kmp::{source_ident, KmpRoutineEntry, KmpTask, TASK_TIED};
use crate::abi::pack::{align_ptr, pack_into, padded_size};
use crate::abi::version::{verify_frame, FrameVersion, VersionedFrame};
use crate::runtime::{KmpRuntime, TeamRuntime};
use crate::util::error::{fatal, ChildPanic, RtsError};

/// Scope state for the tasking adapter.
#[repr(C)]
#[derive(Debug)]
pub struct TaskingFrame {
    version: FrameVersion,
    gtid: c_int,
}

impl TaskingFrame {
    /// Logical thread id recorded at scope entry.
    #[inline]
    pub fn gtid(&self) -> c_int {
        self.gtid
    }
}

impl VersionedFrame for TaskingFrame {
    const VERSION: FrameVersion = FrameVersion::from_offsets(&[
        offset_of!(TaskingFrame, version),
        offset_of!(TaskingFrame, gtid),
    ]);

    #[inline]
    fn version(&self) -> FrameVersion {
        self.version
    }
}

const _: () = assert!(<TaskingFrame as VersionedFrame>::VERSION.get() == 173);

/// Locate the packed blob inside a running task's descriptor.
///
/// # Safety
///
/// `task` must be the descriptor passed to a routine spawned by
/// [`Tasking::spawn`] with the same `align`.
#[inline(always)]
pub unsafe fn args_from_task(
    task: *mut c_void,
    align: usize,
) -> *mut u8 {
    align_ptr((*task.cast::<KmpTask>()).shareds.cast(), align)
}

/// Run a body with its panic turned into an error.
///
/// # Safety
///
/// Same contract as [`ChildBody::run`].
pub(crate) unsafe fn run_contained<B: ChildBody>(args: *mut u8) -> Result<(), RtsError> {
    // SAFETY: forwarded from the caller.
    panic::catch_unwind(AssertUnwindSafe(|| unsafe { B::run(args) }))
        .map_err(|payload| RtsError::ContainedPanic(ChildPanic::new(payload).message().to_owned()))
}

unsafe extern "C-unwind" fn kmp_entry<R: KmpRuntime, B: ChildBody>(
    _gtid: c_int,
    task: *mut c_void,
) -> c_int {
    let args = args_from_task(task, B::ALIGN);
    if R::CARRIES_UNWIND {
        B::run(args);
    } else if let Err(err) = run_contained::<B>(args) {
        fatal(err);
    }
    0
}

/// Tasking adapter over the runtime `R`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tasking<R = TeamRuntime>(PhantomData<R>);

impl<R: KmpRuntime> Backend for Tasking<R> {
    type Frame = TaskingFrame;
    type Entry = KmpRoutineEntry;

    #[inline]
    fn enter_scope() -> Result<TaskingFrame, RtsError> {
        let gtid = R::global_thread_num(source_ident());
        if gtid < 0 {
            return Err(RtsError::NoWorkerContext);
        }
        Ok(TaskingFrame {
            version: TaskingFrame::VERSION,
            gtid,
        })
    }

    #[inline]
    unsafe fn spawn(
        frame: &mut TaskingFrame,
        entry: KmpRoutineEntry,
        data: *const u8,
        size: usize,
        align: usize,
    ) {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        let loc = source_ident();
        let task = R::task_alloc(
            loc,
            frame.gtid,
            TASK_TIED,
            size_of::<KmpTask>(),
            padded_size(size, align),
            entry,
        );
        if task.is_null() {
            fatal(RtsError::OutOfMemory { size, align });
        }
        pack_into((*task).shareds.cast(), data, size, align);
        trace!(gtid = frame.gtid, size, align, "spawn");
        R::task(loc, frame.gtid, task);
    }

    #[inline]
    fn sync(frame: &mut TaskingFrame) {
        trace!(gtid = frame.gtid, "sync");
        if let Err(failure) = R::taskwait(source_ident(), frame.gtid) {
            failure.resume();
        }
    }

    #[inline]
    fn sync_nothrow(frame: &mut TaskingFrame) {
        if let Err(failure) = R::taskwait(source_ident(), frame.gtid) {
            error!(gtid = frame.gtid, "sync_nothrow swallowed {}", failure);
        }
    }

    #[inline]
    fn leave_scope(frame: TaskingFrame) {
        if let Err(err) = verify_frame(&frame) {
            fatal(err);
        }
    }

    #[inline]
    fn worker_count() -> usize {
        usize::try_from(R::num_threads()).unwrap_or(0)
    }

    #[inline]
    fn worker_id() -> usize {
        usize::try_from(R::thread_num()).unwrap_or(0)
    }

    #[inline]
    fn entry<B: ChildBody>() -> KmpRoutineEntry {
        kmp_entry::<R, B>
    }

    fn with_workers<T: Send>(
        workers: usize,
        f: impl FnOnce() -> T + Send,
    ) -> Result<T, RtsError> {
        R::with_team(workers, f)
    }
}
