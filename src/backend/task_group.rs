//! Task-group adapter
//!
//! Every scope owns a [`TaskGroup`]. A spawn copies the blob into a
//! [`PackedArgs`] and submits a closure that calls the entry on it; the blob
//! is freed when the entry returns. Leaving a scope waits for anything still
//! running in the group, so it doubles as a final sync whose failures are
//! logged rather than raised.

use std::ffi::c_void;
use std::mem::offset_of;

use tracing::{error, trace};

use super::{Backend, ChildBody};
use crate::abi::pack::PackedArgs;
use crate::abi::version::{verify_frame, FrameVersion, VersionedFrame};
use crate::runtime::TaskGroup;
use crate::util::error::{fatal, RtsError};

/// Child entry point: `void (*)(void *args)`.
pub type GroupEntry = unsafe extern "C-unwind" fn(args: *mut c_void);

/// Scope state for the task-group adapter.
#[repr(C)]
#[derive(Debug)]
pub struct TaskGroupFrame {
    version: FrameVersion,
    group: Box<TaskGroup>,
}

impl TaskGroupFrame {
    /// The scope's group.
    #[inline]
    pub fn group(&self) -> &TaskGroup {
        &self.group
    }
}

impl VersionedFrame for TaskGroupFrame {
    const VERSION: FrameVersion = FrameVersion::from_offsets(&[
        offset_of!(TaskGroupFrame, version),
        offset_of!(TaskGroupFrame, group),
    ]);

    #[inline]
    fn version(&self) -> FrameVersion {
        self.version
    }
}

#[cfg(target_pointer_width = "64")]
const _: () = assert!(<TaskGroupFrame as VersionedFrame>::VERSION.get() == 177);

unsafe extern "C-unwind" fn group_entry<B: ChildBody>(args: *mut c_void) {
    B::run(args.cast());
}

/// Task-group adapter on rayon.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskGroupBackend;

impl Backend for TaskGroupBackend {
    type Frame = TaskGroupFrame;
    type Entry = GroupEntry;

    /// Never fails: work goes to the global pool when the caller is outside
    /// any pool.
    #[inline]
    fn enter_scope() -> Result<TaskGroupFrame, RtsError> {
        Ok(TaskGroupFrame {
            version: TaskGroupFrame::VERSION,
            group: Box::default(),
        })
    }

    #[inline]
    unsafe fn spawn(
        frame: &mut TaskGroupFrame,
        entry: GroupEntry,
        data: *const u8,
        size: usize,
        align: usize,
    ) {
        let args = PackedArgs::from_raw(data, size, align);
        trace!(size, align, offset = args.offset(), "spawn");
        frame.group.run(move || {
            // SAFETY: `args` holds the blob this entry was spawned with and
            // lives until the call returns.
            unsafe { entry(args.as_ptr().cast()) };
            drop(args);
        });
    }

    #[inline]
    fn sync(frame: &mut TaskGroupFrame) {
        trace!(pending = frame.group.pending(), "sync");
        if let Err(failure) = frame.group.wait() {
            failure.resume();
        }
    }

    #[inline]
    fn sync_nothrow(frame: &mut TaskGroupFrame) {
        if let Err(failure) = frame.group.wait() {
            error!("sync_nothrow swallowed {}", failure);
        }
    }

    fn leave_scope(frame: TaskGroupFrame) {
        if let Err(err) = verify_frame(&frame) {
            fatal(err);
        }
        if let Err(failure) = frame.group.wait() {
            error!("scope closed over an unjoined failure: {}", failure);
        }
    }

    #[inline]
    fn worker_count() -> usize {
        rayon::current_num_threads()
    }

    #[inline]
    fn worker_id() -> usize {
        rayon::current_thread_index().unwrap_or(0)
    }

    #[inline]
    fn entry<B: ChildBody>() -> GroupEntry {
        group_entry::<B>
    }

    fn with_workers<R: Send>(
        workers: usize,
        f: impl FnOnce() -> R + Send,
    ) -> Result<R, RtsError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("rts-group-{}", i))
            .build()
            .map_err(|e| RtsError::PoolBuild(e.to_string()))?;
        Ok(pool.install(f))
    }
}
