//! C surface tests
//!
//! Drive the `__rts_*` symbols the way generated code does: a frame in
//! caller-owned storage, entries produced by the active backend.

use std::ffi::c_void;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

use forkjoin_rts::abi::version::VersionedFrame;
use forkjoin_rts::RtsError;
use forkjoin_rts::backend::{ActiveBackend, Backend, ChildBody};
use forkjoin_rts::ffi::{self, Frame};

static SUM: AtomicU64 = AtomicU64::new(0);

struct AddPair;

impl ChildBody for AddPair {
    const ALIGN: usize = 16;

    unsafe fn run(args: *mut u8) {
        let [a, b] = args.cast::<[u64; 2]>().read();
        SUM.fetch_add(a + b, Ordering::SeqCst);
    }
}

#[test]
fn test_abi_version_matches_frame() {
    assert_eq!(ffi::__rts_abi_version(), <Frame as VersionedFrame>::VERSION.get());
    #[cfg(not(feature = "task-group"))]
    assert_eq!(ffi::__rts_abi_version(), 173);
}

#[test]
fn test_check_abi_accepts_own_tag() {
    ffi::__rts_check_abi(<Frame as VersionedFrame>::VERSION.get());
}

#[test]
fn test_stale_frame_tag_detected() {
    let expected = <Frame as VersionedFrame>::VERSION.get();
    let found = ActiveBackend::with_workers(2, || {
        let mut sf = MaybeUninit::<Frame>::uninit();
        // SAFETY: the tag is the frame's first field (both frames are
        // repr(C)); it is restored before the frame is left.
        unsafe {
            ffi::__rts_enter_frame(sf.as_mut_ptr());
            assert!(ffi::checked_frame(sf.as_mut_ptr()).is_ok());

            let tag = sf.as_mut_ptr().cast::<u32>();
            tag.write(999);
            let found = match ffi::checked_frame(sf.as_mut_ptr()) {
                Err(RtsError::AbiMismatch { expected, found }) => Some((expected, found)),
                _ => None,
            };
            tag.write(expected);

            ffi::__rts_sync(sf.as_mut_ptr());
            ffi::__rts_leave_frame(sf.as_mut_ptr());
            found
        }
    })
    .unwrap();
    assert_eq!(found, Some((expected, 999)));
}

#[test]
fn test_frame_lifecycle_through_c_surface() {
    ActiveBackend::with_workers(3, || {
        let mut sf = MaybeUninit::<Frame>::uninit();
        let entry = ActiveBackend::entry::<AddPair>();
        // SAFETY: `sf` is written by enter_frame and consumed by leave_frame;
        // each blob is a [u64; 2] that AddPair reads.
        unsafe {
            ffi::__rts_enter_frame(sf.as_mut_ptr());
            for i in 0..10u64 {
                let mut pair = [i, 2 * i];
                ffi::__rts_spawn(
                    sf.as_mut_ptr(),
                    entry,
                    pair.as_mut_ptr().cast::<c_void>(),
                    std::mem::size_of::<[u64; 2]>(),
                    AddPair::ALIGN,
                );
            }
            ffi::__rts_sync(sf.as_mut_ptr());
            ffi::__rts_sync_nothrow(sf.as_mut_ptr());
            ffi::__rts_leave_frame(sf.as_mut_ptr());
        }
    })
    .unwrap();
    // sum of 3i for i in 0..10
    assert_eq!(SUM.load(Ordering::SeqCst), 135);
}

#[test]
fn test_worker_queries() {
    let (count, id) = ActiveBackend::with_workers(4, || {
        (ffi::__rts_get_num_workers(), ffi::__rts_get_worker_id())
    })
    .unwrap();
    assert_eq!(count, 4);
    assert!((0..4).contains(&id));
}

#[test]
fn test_loop_grainsize_per_width() {
    let grains = ActiveBackend::with_workers(4, || {
        (
            ffi::__rts_loop_grainsize_8(255),
            ffi::__rts_loop_grainsize_16(0),
            ffi::__rts_loop_grainsize_32(1000),
            ffi::__rts_loop_grainsize_64(u64::MAX),
        )
    })
    .unwrap();
    // 255 / 32, floor, 1000 / 32, cap
    assert_eq!(grains, (7, 1, 31, 2048));
}

#[cfg(not(feature = "task-group"))]
mod tasking {
    use super::*;
    use std::ffi::c_int;
    use std::sync::atomic::AtomicUsize;

    static LAST: AtomicUsize = AtomicUsize::new(0);

    /// A routine in the shape a front end emits for the tasking ABI.
    unsafe extern "C-unwind" fn outlined(
        _gtid: c_int,
        task: *mut c_void,
    ) -> c_int {
        let args = ffi::__rts_get_args_from_task(task, 32);
        assert_eq!(args as usize % 32, 0);
        LAST.store(args.cast::<usize>().read(), Ordering::SeqCst);
        0
    }

    #[test]
    fn test_hand_written_routine_finds_its_blob() {
        ActiveBackend::with_workers(2, || {
            let mut sf = MaybeUninit::<Frame>::uninit();
            let mut value = 0xfeed_usize;
            // SAFETY: `outlined` reads one usize at alignment 32.
            unsafe {
                ffi::__rts_enter_frame(sf.as_mut_ptr());
                ffi::__rts_spawn(
                    sf.as_mut_ptr(),
                    outlined,
                    (&mut value as *mut usize).cast(),
                    std::mem::size_of::<usize>(),
                    32,
                );
                ffi::__rts_sync(sf.as_mut_ptr());
                ffi::__rts_leave_frame(sf.as_mut_ptr());
            }
        })
        .unwrap();
        assert_eq!(LAST.load(Ordering::SeqCst), 0xfeed);
    }
}
