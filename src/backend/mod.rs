//! Fork-join backends
//!
//! A [`Backend`] is the adapter generated code talks to: enter a scope, spawn
//! children with a copied argument blob, sync, and query the pool. Backends
//! are zero-sized types used only through associated functions, so every call
//! site dispatches statically and inlines. One of them is wired to the C
//! surface as [`ActiveBackend`], chosen by cargo feature:
//!
//! | features        | `ActiveBackend`          |
//! |-----------------|--------------------------|
//! | (default)       | `Tasking<TeamRuntime>`   |
//! | `libomp`        | `Tasking<LibOmp>`        |
//! | `task-group`    | `TaskGroupBackend`       |

pub mod grainsize;
pub mod task_group;
pub mod tasking;

pub use grainsize::{LoopExtent, CHUNKS_PER_WORKER, LARGE_GRAIN_CAP};
pub use task_group::{GroupEntry, TaskGroupBackend, TaskGroupFrame};
pub use tasking::{args_from_task, Tasking, TaskingFrame};

use std::marker::PhantomData;
use std::mem::{align_of, size_of, ManuallyDrop};
use std::ptr;

use crate::abi::version::VersionedFrame;
use crate::util::error::RtsError;

#[cfg(feature = "task-group")]
pub type ActiveBackend = TaskGroupBackend;

#[cfg(all(not(feature = "task-group"), feature = "libomp"))]
pub type ActiveBackend = Tasking<crate::runtime::LibOmp>;

#[cfg(all(not(feature = "task-group"), not(feature = "libomp")))]
pub type ActiveBackend = Tasking<crate::runtime::TeamRuntime>;

/// The body of a spawned child: what a front end outlines into a helper.
///
/// [`Backend::entry`] wraps it in the backend's native entry signature.
pub trait ChildBody {
    /// Alignment the blob is packed at. Must be a power of two.
    const ALIGN: usize;

    /// Run the child.
    ///
    /// # Safety
    ///
    /// `args` points at the blob spawned for this body, aligned to `ALIGN`,
    /// and is not used by anyone else while this runs.
    unsafe fn run(args: *mut u8);
}

/// A fork-join adapter over some task runtime.
pub trait Backend: Sized + 'static {
    /// Per-scope state. Lives on the caller's stack for the scope's extent.
    type Frame: VersionedFrame;

    /// Native child entry point.
    type Entry: Copy + Send + 'static;

    /// Open a parallel scope on the calling thread.
    fn enter_scope() -> Result<Self::Frame, RtsError>;

    /// Schedule `entry` with a private copy of `size` bytes at `data`.
    ///
    /// Returns without waiting for the child to start. Allocation failure is
    /// fatal.
    ///
    /// # Safety
    ///
    /// - `data` must be valid for reads of `size` bytes.
    /// - `align` must be a power of two.
    /// - `entry` must expect a blob of this size and alignment.
    /// - Anything the blob borrows must outlive the next `sync` on `frame`.
    unsafe fn spawn(
        frame: &mut Self::Frame,
        entry: Self::Entry,
        data: *const u8,
        size: usize,
        align: usize,
    );

    /// Wait for every child spawned in this scope. A child panic is resumed
    /// on the calling thread.
    fn sync(frame: &mut Self::Frame);

    /// Like [`Backend::sync`], but a child panic is logged and dropped.
    fn sync_nothrow(frame: &mut Self::Frame);

    /// Close the scope. A frame whose stored tag does not match its layout
    /// is fatal.
    fn leave_scope(frame: Self::Frame);

    /// Workers in the current pool. Read once per loop dispatch.
    fn worker_count() -> usize;

    /// Index of the calling worker in `0..worker_count()`.
    fn worker_id() -> usize;

    /// The native entry point running `B`.
    fn entry<B: ChildBody>() -> Self::Entry;

    /// Run `f` on the calling thread inside a fresh pool of `workers` workers
    /// (0 picks the configured default).
    fn with_workers<R: Send>(
        workers: usize,
        f: impl FnOnce() -> R + Send,
    ) -> Result<R, RtsError>;

    /// Chunk size for a counted loop of `n` iterations.
    ///
    /// # Panics
    ///
    /// If the pool reports zero workers.
    #[inline]
    fn grainsize<T: LoopExtent>(n: T) -> T {
        match grainsize::grainsize(n, Self::worker_count()) {
            Ok(grain) => grain,
            Err(err) => panic!("{}", err),
        }
    }

    /// Spawn a known body with `data` as its blob.
    ///
    /// # Safety
    ///
    /// `data` must be a blob `B::run` accepts, and anything it borrows must
    /// outlive the next `sync` on `frame`.
    #[inline]
    unsafe fn spawn_body<B: ChildBody>(
        frame: &mut Self::Frame,
        data: &[u8],
    ) {
        Self::spawn(frame, Self::entry::<B>(), data.as_ptr(), data.len(), B::ALIGN)
    }
}

/// Body that moves a closure out of its blob and calls it.
struct ClosureBody<F>(PhantomData<F>);

impl<F: FnOnce()> ChildBody for ClosureBody<F> {
    const ALIGN: usize = align_of::<F>();

    #[inline]
    unsafe fn run(args: *mut u8) {
        let f = ptr::read(args.cast::<F>());
        f();
    }
}

/// Spawn a closure whose captures outlive the scope.
#[inline]
pub fn spawn_closure<B, F>(
    frame: &mut B::Frame,
    f: F,
) where
    B: Backend,
    F: FnOnce() + Send + 'static,
{
    // SAFETY: F is 'static, so nothing it captures can dangle.
    unsafe { spawn_closure_unchecked::<B, F>(frame, f) }
}

/// Spawn a closure that may borrow from the caller.
///
/// The closure's bytes are the blob; the child moves it back out and calls it.
///
/// # Safety
///
/// Everything `f` borrows must outlive the next `sync` on `frame`, including
/// on the unwinding path.
#[inline]
pub unsafe fn spawn_closure_unchecked<B, F>(
    frame: &mut B::Frame,
    f: F,
) where
    B: Backend,
    F: FnOnce() + Send,
{
    // The blob copy owns the closure from here on.
    let f = ManuallyDrop::new(f);
    let data = (&*f as *const F).cast::<u8>();
    B::spawn(frame, B::entry::<ClosureBody<F>>(), data, size_of::<F>(), align_of::<F>());
}
