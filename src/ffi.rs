//! C surface for generated code
//!
//! The `__rts_*` symbols a front end emits calls to, bound to
//! [`ActiveBackend`]. The frame lives in caller-owned storage of
//! `size_of::<Frame>()` bytes: `__rts_enter_frame` initializes it and
//! `__rts_leave_frame` consumes it. The operations that may run a child's
//! panic use the `C-unwind` ABI so the panic reaches the caller's frame.
//!
//! Every call that takes a frame checks its stored tag first; a frame written
//! by code built against another layout aborts the process.

use std::ffi::{c_int, c_void};
use std::ptr;

use crate::abi::version::{verify_frame, verify_frame_version, VersionedFrame};
use crate::backend::grainsize::{self, LoopExtent};
use crate::backend::{ActiveBackend, Backend};
use crate::util::error::{fatal, RtsError};

/// Frame type of the active backend.
pub type Frame = <ActiveBackend as Backend>::Frame;

/// Child entry type of the active backend.
pub type Entry = <ActiveBackend as Backend>::Entry;

#[no_mangle]
pub extern "C" fn __rts_get_num_workers() -> c_int {
    c_int::try_from(ActiveBackend::worker_count()).unwrap_or(c_int::MAX)
}

#[no_mangle]
pub extern "C" fn __rts_get_worker_id() -> c_int {
    c_int::try_from(ActiveBackend::worker_id()).unwrap_or(c_int::MAX)
}

/// Layout tag of the active frame type, for comparison with the value baked
/// into generated code.
#[no_mangle]
pub extern "C" fn __rts_abi_version() -> u32 {
    <Frame as VersionedFrame>::VERSION.get()
}

/// Abort unless `tag`, the value baked into generated code, matches the
/// active frame layout.
#[no_mangle]
pub extern "C" fn __rts_check_abi(tag: u32) {
    if let Err(err) = verify_frame_version::<Frame>(tag) {
        fatal(err);
    }
}

/// Borrow the frame in `sf` after checking its tag.
///
/// # Safety
///
/// `sf` must point to initialized frame storage.
pub unsafe fn checked_frame<'a>(sf: *mut Frame) -> Result<&'a mut Frame, RtsError> {
    let frame = &mut *sf;
    verify_frame(frame)?;
    Ok(frame)
}

#[inline(always)]
unsafe fn live_frame<'a>(sf: *mut Frame) -> &'a mut Frame {
    match checked_frame(sf) {
        Ok(frame) => frame,
        Err(err) => fatal(err),
    }
}

/// Open a scope in `sf`. Aborts when the caller is outside a worker pool.
///
/// # Safety
///
/// `sf` must be valid for writes of a `Frame` and hold no live frame.
#[no_mangle]
pub unsafe extern "C-unwind" fn __rts_enter_frame(sf: *mut Frame) {
    match ActiveBackend::enter_scope() {
        Ok(frame) => ptr::write(sf, frame),
        Err(err) => fatal(err),
    }
}

/// # Safety
///
/// `sf` must hold a live frame, `data` must be readable for `data_size`
/// bytes, and `alignment` must be a power of two.
#[no_mangle]
pub unsafe extern "C-unwind" fn __rts_spawn(
    sf: *mut Frame,
    entry: Entry,
    data: *mut c_void,
    data_size: usize,
    alignment: usize,
) {
    ActiveBackend::spawn(live_frame(sf), entry, data.cast_const().cast(), data_size, alignment);
}

/// # Safety
///
/// `sf` must hold a live frame.
#[no_mangle]
pub unsafe extern "C-unwind" fn __rts_sync(sf: *mut Frame) {
    ActiveBackend::sync(live_frame(sf));
}

/// # Safety
///
/// `sf` must hold a live frame.
#[no_mangle]
pub unsafe extern "C-unwind" fn __rts_sync_nothrow(sf: *mut Frame) {
    ActiveBackend::sync_nothrow(live_frame(sf));
}

/// # Safety
///
/// `sf` must hold a live frame; it is dead afterwards.
#[no_mangle]
pub unsafe extern "C-unwind" fn __rts_leave_frame(sf: *mut Frame) {
    live_frame(sf);
    ActiveBackend::leave_scope(ptr::read(sf));
}

/// Aligned blob of a running task.
///
/// # Safety
///
/// `task` must be the descriptor handed to an entry spawned with `alignment`.
#[cfg(not(feature = "task-group"))]
#[no_mangle]
pub unsafe extern "C" fn __rts_get_args_from_task(
    task: *mut c_void,
    alignment: usize,
) -> *mut c_void {
    crate::backend::args_from_task(task, alignment).cast()
}

#[inline(always)]
fn loop_grainsize<T: LoopExtent>(n: T) -> T {
    match grainsize::grainsize(n, ActiveBackend::worker_count()) {
        Ok(grain) => grain,
        Err(err) => fatal(err),
    }
}

#[no_mangle]
pub extern "C" fn __rts_loop_grainsize_8(n: u8) -> u8 {
    loop_grainsize(n)
}

#[no_mangle]
pub extern "C" fn __rts_loop_grainsize_16(n: u16) -> u16 {
    loop_grainsize(n)
}

#[no_mangle]
pub extern "C" fn __rts_loop_grainsize_32(n: u32) -> u32 {
    loop_grainsize(n)
}

#[no_mangle]
pub extern "C" fn __rts_loop_grainsize_64(n: u64) -> u64 {
    loop_grainsize(n)
}
