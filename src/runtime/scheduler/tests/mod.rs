//! Team runtime unit tests
//!
//! Queue and stealer behavior on raw descriptors, plus the `__kmpc` surface
//! of [`TeamRuntime`] driven inside real teams.


use std::ffi::{c_int, c_void};
use std::mem::size_of;
use std::sync::Arc;

use crate::abi::kmp::KmpTask;
use crate::runtime::scheduler::task::{self, TaskId, TaskNode, TaskRef};

unsafe extern "C-unwind" fn noop(
    _gtid: c_int,
    _task: *mut c_void,
) -> c_int {
    0
}

/// A standalone descriptor with a no-op routine.
fn make_task(id: usize) -> TaskRef {
    let raw = task::allocate(
        TaskId(id),
        1,
        Arc::new(TaskNode::new()),
        size_of::<KmpTask>(),
        0,
        noop,
    );
    // SAFETY: freshly allocated and owned here.
    unsafe { TaskRef::from_raw(raw.as_ptr()) }.unwrap()
}

/// Run and free a descriptor made by [`make_task`].
fn finish(task: TaskRef) {
    let (_, result) = task.invoke(0);
    assert!(result.is_ok());
}
