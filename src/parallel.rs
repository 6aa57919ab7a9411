//! Structured fork-join on top of any [`Backend`]
//!
//! [`par_do`] runs two closures in parallel and joins them. [`parallel_for`]
//! is the divide-and-conquer loop a front end lowers a parallel `for` into:
//! while a range is larger than one grain, spawn its lower 9/16 and keep
//! splitting the rest on the current thread.
//!
//! Both keep their scope in a [`ScopeGuard`], which joins on the unwinding
//! path too, so spawned closures may borrow from the caller's stack.

use std::ops::Range;

use crate::backend::{spawn_closure_unchecked, Backend, LoopExtent};
use crate::util::error::RtsError;

/// An entered scope that is synced and left when dropped.
///
/// [`ScopeGuard::finish`] is the normal exit and raises child failures; the
/// drop path uses `sync_nothrow` so it never panics while unwinding.
pub struct ScopeGuard<B: Backend> {
    frame: Option<B::Frame>,
}

impl<B: Backend> ScopeGuard<B> {
    /// Enter a scope on the calling thread.
    #[inline]
    pub fn enter() -> Result<Self, RtsError> {
        Ok(Self {
            frame: Some(B::enter_scope()?),
        })
    }

    /// The live frame.
    #[inline]
    pub fn frame(&mut self) -> &mut B::Frame {
        match self.frame.as_mut() {
            Some(frame) => frame,
            None => unreachable!("scope already left"),
        }
    }

    /// Spawn a closure that borrows from the enclosing stack.
    ///
    /// # Safety
    ///
    /// The guard must be finished or dropped, not leaked, while everything
    /// `f` borrows is still alive.
    #[inline]
    pub unsafe fn spawn<F>(
        &mut self,
        f: F,
    ) where
        F: FnOnce() + Send,
    {
        spawn_closure_unchecked::<B, F>(self.frame(), f)
    }

    /// Join outstanding children, resuming a child panic.
    #[inline]
    pub fn sync(&mut self) {
        B::sync(self.frame());
    }

    /// Sync and leave the scope.
    #[inline]
    pub fn finish(mut self) {
        if let Some(mut frame) = self.frame.take() {
            B::sync(&mut frame);
            B::leave_scope(frame);
        }
    }
}

impl<B: Backend> Drop for ScopeGuard<B> {
    fn drop(&mut self) {
        if let Some(mut frame) = self.frame.take() {
            B::sync_nothrow(&mut frame);
            B::leave_scope(frame);
        }
    }
}

/// Run `left` on the calling thread and `right` as a spawned child, then join.
pub fn par_do<B, L, R, RL, RR>(
    left: L,
    right: R,
) -> Result<(RL, RR), RtsError>
where
    B: Backend,
    L: FnOnce() -> RL,
    R: FnOnce() -> RR + Send,
    RR: Send,
{
    let mut right_out = None;
    let mut scope = ScopeGuard::<B>::enter()?;
    {
        let slot = &mut right_out;
        // SAFETY: `slot` and `right` are only touched by the child, and the
        // scope joins it before `right_out` is read or dropped.
        unsafe {
            spawn_closure_unchecked::<B, _>(scope.frame(), move || *slot = Some(right()));
        }
    }
    let left_out = left();
    scope.finish();

    match right_out {
        Some(right_out) => Ok((left_out, right_out)),
        None => unreachable!("joined child left no result"),
    }
}

/// Call `body(i)` for every `i` in `range`, in parallel chunks.
///
/// `grain` of `None` or zero asks the backend's grainsize advisor.
pub fn parallel_for<B, I, F>(
    range: Range<I>,
    grain: Option<I>,
    body: &F,
) -> Result<(), RtsError>
where
    B: Backend,
    I: LoopExtent,
    F: Fn(I) + Sync,
{
    if range.end <= range.start {
        return Ok(());
    }
    let start = range.start.to_u128();
    let end = range.end.to_u128();
    let grain = match grain {
        Some(grain) if grain.to_u128() > 0 => grain.to_u128(),
        _ => B::grainsize(I::from_u128(end - start)).to_u128(),
    };
    split::<B, I, F>(start, end, grain, body)
}

fn split<B, I, F>(
    mut start: u128,
    end: u128,
    grain: u128,
    body: &F,
) -> Result<(), RtsError>
where
    B: Backend,
    I: LoopExtent,
    F: Fn(I) + Sync,
{
    let mut scope = ScopeGuard::<B>::enter()?;
    while end - start > grain {
        let n = end - start;
        let mid = start + 9 * (n + 1) / 16;
        let (lo, hi) = (start, mid);
        // SAFETY: `scope` is finished or dropped before `body` goes away.
        unsafe {
            scope.spawn(move || {
                if let Err(err) = split::<B, I, F>(lo, hi, grain, body) {
                    panic!("{}", err);
                }
            });
        }
        start = mid;
    }
    for i in start..end {
        body(I::from_u128(i));
    }
    scope.finish();
    Ok(())
}
