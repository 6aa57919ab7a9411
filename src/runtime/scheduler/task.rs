//! Task descriptors and join counters for the team runtime.
//!
//! A descriptor handed out by `task_alloc` is one allocation:
//!
//! ```text
//! [ TaskHeader | KmpTask (sizeof_task bytes) | shareds (sizeof_shareds bytes) ]
//!               ^ pointer given to the caller
//! ```
//!
//! The header sits in front of the public `KmpTask` and is found by walking
//! back a fixed distance, so the caller only ever sees the foreign layout.

use std::alloc::{self, Layout};
use std::ffi::{c_int, c_void};
use std::mem::{align_of, size_of, ManuallyDrop};
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::abi::kmp::{KmpCmplrData, KmpRoutineEntry, KmpTask};
use crate::abi::pack::align_up;
use crate::util::error::{ChildPanic, RtsError};

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub usize);

impl TaskId {
    /// Get the inner value.
    #[inline]
    pub fn inner(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// Join counter for the direct children of one task.
///
/// Every executing task, and every thread's implicit task, owns one. Children
/// hold an `Arc` to their parent's node until they finish.
#[derive(Debug, Default)]
pub struct TaskNode {
    pending: AtomicUsize,
    failure: Mutex<Option<ChildPanic>>,
}

impl TaskNode {
    /// Create a node with no children.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a newly submitted child.
    #[inline]
    pub fn add_child(&self) {
        self.pending.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark one child finished. Returns true if it was the last one.
    #[inline]
    pub fn complete_child(&self) -> bool {
        self.pending.fetch_sub(1, Ordering::Release) == 1
    }

    /// Children submitted and not yet finished.
    #[inline]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Keep the first child failure; later ones are logged and dropped.
    pub fn record_failure(
        &self,
        failure: ChildPanic,
    ) {
        let mut slot = self.failure.lock();
        if slot.is_none() {
            *slot = Some(failure);
        } else {
            tracing::debug!("discarding additional child failure: {}", failure);
        }
    }

    /// Take the recorded failure, if any.
    #[inline]
    pub fn take_failure(&self) -> Option<ChildPanic> {
        self.failure.lock().take()
    }
}

impl Drop for TaskNode {
    fn drop(&mut self) {
        if let Some(failure) = self.failure.get_mut().take() {
            tracing::warn!("task ended without joining a failed child: {}", failure);
        }
    }
}

/// Hidden prefix of every descriptor allocation.
#[repr(C)]
struct TaskHeader {
    id: TaskId,
    flags: c_int,
    size: usize,
    parent: ManuallyDrop<Arc<TaskNode>>,
}

const fn max(
    a: usize,
    b: usize,
) -> usize {
    if a > b {
        a
    } else {
        b
    }
}

/// Distance from the allocation start to the public `KmpTask`.
const HEADER_SPAN: usize = align_up(size_of::<TaskHeader>(), align_of::<KmpTask>());

/// Alignment of the whole allocation.
const REGION_ALIGN: usize = max(align_of::<TaskHeader>(), align_of::<KmpTask>());

/// Allocate a descriptor whose payload region has `sizeof_shareds` usable bytes.
///
/// Allocation failure is fatal.
pub(crate) fn allocate(
    id: TaskId,
    flags: c_int,
    parent: Arc<TaskNode>,
    sizeof_task: usize,
    sizeof_shareds: usize,
    entry: KmpRoutineEntry,
) -> NonNull<KmpTask> {
    assert!(
        sizeof_task >= size_of::<KmpTask>(),
        "descriptor size {} smaller than kmp_task_t",
        sizeof_task
    );
    let shareds_offset = HEADER_SPAN + align_up(sizeof_task, align_of::<*mut c_void>());
    let layout = shareds_offset
        .checked_add(sizeof_shareds)
        .and_then(|total| Layout::from_size_align(total, REGION_ALIGN).ok())
        .unwrap_or_else(|| {
            panic!(
                "{}",
                RtsError::OutOfMemory {
                    size: sizeof_shareds,
                    align: REGION_ALIGN,
                }
            )
        });

    // SAFETY: layout has non-zero size (it includes the header).
    let base = unsafe { alloc::alloc(layout) };
    if base.is_null() {
        alloc::handle_alloc_error(layout);
    }

    // SAFETY: the allocation covers header, descriptor and payload at the
    // offsets computed above, each suitably aligned.
    unsafe {
        base.cast::<TaskHeader>().write(TaskHeader {
            id,
            flags,
            size: layout.size(),
            parent: ManuallyDrop::new(parent),
        });
        let task = base.add(HEADER_SPAN).cast::<KmpTask>();
        task.write(KmpTask {
            shareds: base.add(shareds_offset).cast(),
            routine: Some(entry),
            part_id: 0,
            data1: KmpCmplrData::zeroed(),
            data2: KmpCmplrData::zeroed(),
        });
        NonNull::new_unchecked(task)
    }
}

/// Owning handle to a submitted descriptor.
///
/// Dropping a handle that was never invoked frees the descriptor and its
/// parent link without running the routine.
#[derive(Debug)]
pub struct TaskRef(NonNull<KmpTask>);

// SAFETY: a submitted descriptor is owned by exactly one queue slot or worker.
unsafe impl Send for TaskRef {}

impl TaskRef {
    /// Take ownership of a descriptor returned by [`allocate`].
    ///
    /// # Safety
    ///
    /// `task` must come from `allocate` and must not be owned elsewhere.
    #[inline]
    pub(crate) unsafe fn from_raw(task: *mut KmpTask) -> Option<Self> {
        NonNull::new(task).map(Self)
    }

    #[inline]
    fn header(&self) -> &TaskHeader {
        // SAFETY: every TaskRef points HEADER_SPAN bytes past a live header.
        unsafe { &*self.0.as_ptr().cast::<u8>().sub(HEADER_SPAN).cast::<TaskHeader>() }
    }

    /// Raw descriptor pointer.
    #[inline]
    pub fn as_ptr(&self) -> *mut KmpTask {
        self.0.as_ptr()
    }

    /// Task id.
    #[inline]
    pub fn id(&self) -> TaskId {
        self.header().id
    }

    /// Allocation flags.
    #[inline]
    pub fn flags(&self) -> c_int {
        self.header().flags
    }

    /// Join counter of the task that allocated this one.
    #[inline]
    pub fn parent(&self) -> &Arc<TaskNode> {
        &self.header().parent
    }

    /// Run the routine, free the descriptor, and hand back the parent node.
    pub(crate) fn invoke(
        self,
        gtid: c_int,
    ) -> (Arc<TaskNode>, thread::Result<()>) {
        let this = ManuallyDrop::new(self);
        let task = this.0.as_ptr();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            // SAFETY: the descriptor is live until released below.
            if let Some(routine) = unsafe { (*task).routine } {
                // SAFETY: the routine was registered for exactly this descriptor.
                unsafe { routine(gtid, task.cast()) };
            }
        }));
        // SAFETY: the routine has returned; nothing else references the descriptor.
        let parent = unsafe { release(this.0) };
        (parent, result)
    }
}

impl Drop for TaskRef {
    fn drop(&mut self) {
        tracing::debug!(task = %self.id(), "dropping descriptor that never ran");
        // SAFETY: the handle owns the descriptor and is not used again.
        drop(unsafe { release(self.0) });
    }
}

/// Free a descriptor allocation and return its parent link.
///
/// # Safety
///
/// `task` must come from [`allocate`] and must not be used afterwards.
unsafe fn release(task: NonNull<KmpTask>) -> Arc<TaskNode> {
    let base = task.as_ptr().cast::<u8>().sub(HEADER_SPAN);
    let header = base.cast::<TaskHeader>();
    let parent = ManuallyDrop::take(&mut (*header).parent);
    let layout = Layout::from_size_align_unchecked((*header).size, REGION_ALIGN);
    alloc::dealloc(base, layout);
    parent
}
