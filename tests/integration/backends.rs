//! Backend integration tests
//!
//! The same spawn/sync scenarios run against both adapters, and their
//! observable results are compared.

use std::any::type_name;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::mem::align_of;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use forkjoin_rts::backend::{Backend, ChildBody, TaskGroupBackend, Tasking};
use forkjoin_rts::runtime::TeamRuntime;
use forkjoin_rts::RtsError;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

type Omp = Tasking<TeamRuntime>;

/// Bytes each `CopyOut` instantiation received, keyed by its type name.
static SINK: Lazy<Mutex<HashMap<&'static str, Vec<u8>>>> = Lazy::new(Default::default);

struct CopyOut<B, const SIZE: usize, const A: usize>(PhantomData<B>);

impl<B, const SIZE: usize, const A: usize> ChildBody for CopyOut<B, SIZE, A> {
    const ALIGN: usize = A;

    unsafe fn run(args: *mut u8) {
        assert_eq!(args as usize % A, 0, "blob misaligned");
        let bytes = std::slice::from_raw_parts(args, SIZE).to_vec();
        SINK.lock().insert(type_name::<Self>(), bytes);
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 131 + 17) as u8).collect()
}

fn round_trip<B: Backend, const SIZE: usize, const ALIGN: usize>() -> Vec<u8> {
    let data = pattern(SIZE);
    let mut frame = B::enter_scope().unwrap();
    // SAFETY: CopyOut reads exactly SIZE bytes.
    unsafe { B::spawn_body::<CopyOut<B, SIZE, ALIGN>>(&mut frame, &data) };
    drop(data);
    B::sync(&mut frame);
    B::leave_scope(frame);

    let got = SINK
        .lock()
        .remove(type_name::<CopyOut<B, SIZE, ALIGN>>())
        .unwrap_or_else(|| panic!("child for {} bytes at {} never ran", SIZE, ALIGN));
    assert_eq!(got, pattern(SIZE), "{} bytes at alignment {}", SIZE, ALIGN);
    got
}

fn round_trip_grid<B: Backend>() -> Vec<Vec<u8>> {
    B::with_workers(4, || {
        vec![
            round_trip::<B, 0, 1>(),
            round_trip::<B, 0, 8>(),
            round_trip::<B, 0, 64>(),
            round_trip::<B, 1, 1>(),
            round_trip::<B, 1, 8>(),
            round_trip::<B, 1, 64>(),
            round_trip::<B, 7, 1>(),
            round_trip::<B, 7, 8>(),
            round_trip::<B, 7, 64>(),
            round_trip::<B, 4096, 1>(),
            round_trip::<B, 4096, 8>(),
            round_trip::<B, 4096, 64>(),
        ]
    })
    .unwrap()
}

/// Increments the counter whose address is the blob.
struct Bump;

impl ChildBody for Bump {
    const ALIGN: usize = align_of::<usize>();

    unsafe fn run(args: *mut u8) {
        let counter = args.cast::<*const AtomicUsize>().read();
        (*counter).fetch_add(1, Ordering::SeqCst);
    }
}

fn spawn_bump<B: Backend>(
    frame: &mut B::Frame,
    counter: &AtomicUsize,
) {
    let addr = counter as *const AtomicUsize as usize;
    // SAFETY: Bump reads one pointer; the counter outlives the caller's sync.
    unsafe { B::spawn_body::<Bump>(frame, &addr.to_ne_bytes()) };
}

fn count_to<B: Backend>(k: usize) -> usize {
    let counter = AtomicUsize::new(0);
    B::with_workers(4, || {
        let mut frame = B::enter_scope().unwrap();
        for _ in 0..k {
            spawn_bump::<B>(&mut frame, &counter);
        }
        B::sync(&mut frame);
        let seen = counter.load(Ordering::SeqCst);
        B::leave_scope(frame);
        seen
    })
    .unwrap()
}

struct Boom;

impl ChildBody for Boom {
    const ALIGN: usize = 1;

    unsafe fn run(_args: *mut u8) {
        panic!("boom in child");
    }
}

/// Records whether `worker_id` was in range on the thread that ran it.
struct CheckId<B>(PhantomData<B>);

static ID_OUT_OF_RANGE: AtomicBool = AtomicBool::new(false);

impl<B: Backend> ChildBody for CheckId<B> {
    const ALIGN: usize = 1;

    unsafe fn run(_args: *mut u8) {
        if B::worker_id() >= B::worker_count() {
            ID_OUT_OF_RANGE.store(true, Ordering::SeqCst);
        }
    }
}

#[test]
fn test_round_trip_backends_agree() {
    let omp = round_trip_grid::<Omp>();
    let group = round_trip_grid::<TaskGroupBackend>();
    assert_eq!(omp, group);
}

#[test]
fn test_counter_tasking() {
    for k in [0, 1, 1000] {
        assert_eq!(count_to::<Omp>(k), k);
    }
}

#[test]
fn test_counter_task_group() {
    for k in [0, 1, 1000] {
        assert_eq!(count_to::<TaskGroupBackend>(k), k);
    }
}

#[test]
fn test_counter_and_grainsize_backends_agree() {
    for k in [0, 1, 1000] {
        assert_eq!(count_to::<Omp>(k), count_to::<TaskGroupBackend>(k));
    }
    for n in [0u64, 1, 100, 1 << 20, u64::MAX] {
        let a = Omp::with_workers(4, || Omp::grainsize(n)).unwrap();
        let b = TaskGroupBackend::with_workers(4, || TaskGroupBackend::grainsize(n)).unwrap();
        assert_eq!(a, b, "grainsize({})", n);
    }
}

fn nothrow_swallows<B: Backend>() {
    let returned = B::with_workers(2, || {
        let mut frame = B::enter_scope().unwrap();
        // SAFETY: Boom ignores its blob.
        unsafe { B::spawn_body::<Boom>(&mut frame, &[]) };
        B::sync_nothrow(&mut frame);
        B::leave_scope(frame);
        true
    })
    .unwrap();
    assert!(returned);
}

fn sync_propagates<B: Backend>() {
    let caught = B::with_workers(2, || {
        let mut frame = B::enter_scope().unwrap();
        // SAFETY: Boom ignores its blob.
        unsafe { B::spawn_body::<Boom>(&mut frame, &[]) };
        let result = panic::catch_unwind(AssertUnwindSafe(|| B::sync(&mut frame)));
        B::leave_scope(frame);
        result.err().map(|payload| payload.downcast_ref::<&str>().copied())
    })
    .unwrap();
    assert_eq!(caught, Some(Some("boom in child")));
}

#[test]
fn test_nothrow_tasking() {
    nothrow_swallows::<Omp>();
    sync_propagates::<Omp>();
}

#[test]
fn test_nothrow_task_group() {
    nothrow_swallows::<TaskGroupBackend>();
    sync_propagates::<TaskGroupBackend>();
}

fn sync_twice<B: Backend>() -> Duration {
    let counter = AtomicUsize::new(0);
    B::with_workers(2, || {
        let mut frame = B::enter_scope().unwrap();
        for _ in 0..10 {
            spawn_bump::<B>(&mut frame, &counter);
        }
        B::sync(&mut frame);
        let start = Instant::now();
        B::sync(&mut frame);
        let second = start.elapsed();
        B::leave_scope(frame);
        second
    })
    .unwrap()
}

/// After `sync_nothrow` swallowed a failure, a later `sync` has nothing left
/// to resume and returns normally; fresh children still run.
fn sync_after_swallowed_failure<B: Backend>() -> usize {
    let counter = AtomicUsize::new(0);
    B::with_workers(2, || {
        let mut frame = B::enter_scope().unwrap();
        // SAFETY: Boom ignores its blob.
        unsafe { B::spawn_body::<Boom>(&mut frame, &[]) };
        B::sync_nothrow(&mut frame);

        let second = panic::catch_unwind(AssertUnwindSafe(|| B::sync(&mut frame)));
        assert!(second.is_ok(), "sync resumed a failure already swallowed");

        spawn_bump::<B>(&mut frame, &counter);
        B::sync(&mut frame);
        B::leave_scope(frame);
    })
    .unwrap();
    counter.into_inner()
}

#[test]
fn test_sync_idempotent() {
    assert!(sync_twice::<Omp>() < Duration::from_secs(1));
    assert!(sync_twice::<TaskGroupBackend>() < Duration::from_secs(1));
}

#[test]
fn test_sync_after_nothrow_returns() {
    assert_eq!(sync_after_swallowed_failure::<Omp>(), 1);
    assert_eq!(sync_after_swallowed_failure::<TaskGroupBackend>(), 1);
}

#[test]
fn test_enter_scope_outside_pool() {
    assert!(matches!(Omp::enter_scope(), Err(RtsError::NoWorkerContext)));
    let frame = TaskGroupBackend::enter_scope().unwrap();
    TaskGroupBackend::leave_scope(frame);
}

fn ids_in_range<B: Backend>() {
    B::with_workers(3, || {
        let mut frame = B::enter_scope().unwrap();
        for _ in 0..200 {
            // SAFETY: CheckId ignores its blob.
            unsafe { B::spawn_body::<CheckId<B>>(&mut frame, &[]) };
        }
        B::sync(&mut frame);
        B::leave_scope(frame);
    })
    .unwrap();
}

#[test]
fn test_worker_ids_in_range() {
    ids_in_range::<Omp>();
    ids_in_range::<TaskGroupBackend>();
    assert!(!ID_OUT_OF_RANGE.load(Ordering::SeqCst));
}

#[test]
fn test_blob_copy_is_private() {
    // The caller's buffer is overwritten right after spawn; the child must
    // still see the original bytes.
    let seen = Omp::with_workers(2, || {
        let mut data = pattern(64);
        let mut frame = Omp::enter_scope().unwrap();
        // SAFETY: CopyOut reads exactly 64 bytes.
        unsafe { Omp::spawn_body::<CopyOut<(u8, Omp), 64, 16>>(&mut frame, &data) };
        data.fill(0);
        Omp::sync(&mut frame);
        Omp::leave_scope(frame);
        SINK.lock().remove(type_name::<CopyOut<(u8, Omp), 64, 16>>())
    })
    .unwrap();
    assert_eq!(seen, Some(pattern(64)));
}
