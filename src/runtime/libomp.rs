//! `KmpRuntime` bound to the system OpenMP runtime (libomp).
//!
//! Enabled with the `libomp` feature; links against `-lomp`. libomp cannot carry
//! a Rust unwind across its own frames, so task routines catch a panic before
//! returning into libomp and abort the process. `taskwait` never reports a
//! failure.

use std::ffi::{c_int, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use crate::abi::kmp::{source_ident, Ident, KmpRoutineEntry, KmpTask};
use crate::runtime::KmpRuntime;
use crate::util::error::{ChildPanic, RtsError};

type KmpcMicro = unsafe extern "C" fn(global_tid: *mut c_int, bound_tid: *mut c_int, arg: *mut c_void);

#[link(name = "omp")]
extern "C" {
    fn __kmpc_global_thread_num(loc: *const Ident) -> c_int;
    fn __kmpc_omp_task_alloc(
        loc: *const Ident,
        gtid: c_int,
        flags: c_int,
        sizeof_kmp_task_t: usize,
        sizeof_shareds: usize,
        task_entry: KmpRoutineEntry,
    ) -> *mut KmpTask;
    fn __kmpc_omp_task(loc: *const Ident, gtid: c_int, new_task: *mut KmpTask) -> c_int;
    fn __kmpc_omp_taskwait(loc: *const Ident, gtid: c_int) -> c_int;
    fn __kmpc_push_num_threads(loc: *const Ident, gtid: c_int, num_threads: c_int);
    fn __kmpc_fork_call(loc: *const Ident, argc: c_int, microtask: KmpcMicro, ...);
    fn omp_get_num_threads() -> c_int;
    fn omp_get_thread_num() -> c_int;
}

/// The system libomp.
#[derive(Debug, Clone, Copy, Default)]
pub struct LibOmp;

struct Region<F, R> {
    body: Option<F>,
    out: Option<thread::Result<R>>,
}

/// Outlined `parallel` body: the master runs the closure, the rest of the
/// team falls through to the region's closing barrier and executes tasks there.
unsafe extern "C" fn region_body<F: FnOnce() -> R, R>(
    _global_tid: *mut c_int,
    _bound_tid: *mut c_int,
    arg: *mut c_void,
) {
    if omp_get_thread_num() != 0 {
        return;
    }
    let region = &mut *arg.cast::<Region<F, R>>();
    if let Some(body) = region.body.take() {
        region.out = Some(panic::catch_unwind(AssertUnwindSafe(body)));
    }
}

fn region_body_for<F: FnOnce() -> R, R>(_: &Region<F, R>) -> KmpcMicro {
    region_body::<F, R>
}

impl KmpRuntime for LibOmp {
    const CARRIES_UNWIND: bool = false;

    #[inline]
    fn global_thread_num(loc: &Ident) -> c_int {
        // SAFETY: libomp only reads the ident.
        unsafe { __kmpc_global_thread_num(loc) }
    }

    #[inline]
    unsafe fn task_alloc(
        loc: &Ident,
        gtid: c_int,
        flags: c_int,
        sizeof_task: usize,
        sizeof_shareds: usize,
        entry: KmpRoutineEntry,
    ) -> *mut KmpTask {
        __kmpc_omp_task_alloc(loc, gtid, flags, sizeof_task, sizeof_shareds, entry)
    }

    #[inline]
    unsafe fn task(
        loc: &Ident,
        gtid: c_int,
        task: *mut KmpTask,
    ) -> c_int {
        __kmpc_omp_task(loc, gtid, task)
    }

    #[inline]
    fn taskwait(
        loc: &Ident,
        gtid: c_int,
    ) -> Result<(), ChildPanic> {
        // SAFETY: gtid was obtained from __kmpc_global_thread_num.
        unsafe { __kmpc_omp_taskwait(loc, gtid) };
        Ok(())
    }

    #[inline]
    fn num_threads() -> c_int {
        // SAFETY: plain query.
        unsafe { omp_get_num_threads() }
    }

    #[inline]
    fn thread_num() -> c_int {
        // SAFETY: plain query.
        unsafe { omp_get_thread_num() }
    }

    fn with_team<R: Send>(
        workers: usize,
        f: impl FnOnce() -> R + Send,
    ) -> Result<R, RtsError> {
        let loc = source_ident();
        let mut region = Region {
            body: Some(f),
            out: None,
        };
        let micro = region_body_for(&region);

        // SAFETY: `region` outlives the fork call, which joins the whole team
        // before returning.
        unsafe {
            let gtid = __kmpc_global_thread_num(loc);
            if workers > 0 {
                __kmpc_push_num_threads(loc, gtid, workers as c_int);
            }
            __kmpc_fork_call(loc, 1, micro, (&mut region as *mut Region<_, R>).cast::<c_void>());
        }

        match region.out {
            Some(Ok(value)) => Ok(value),
            Some(Err(payload)) => panic::resume_unwind(payload),
            None => Err(RtsError::NoWorkerContext),
        }
    }
}
