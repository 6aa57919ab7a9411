//! Loop grainsize advisor
//!
//! Picks how many iterations of a counted loop form one schedulable chunk:
//! about [`CHUNKS_PER_WORKER`] chunks per worker, never fewer than one
//! iteration, and never more than the extent type's large-grain cap.

use std::fmt::Debug;

use crate::util::error::RtsError;

/// Target number of chunks per worker.
pub const CHUNKS_PER_WORKER: usize = 8;

/// Largest chunk handed out for extents wide enough to hold it.
pub const LARGE_GRAIN_CAP: u16 = 2048;

mod sealed {
    pub trait Sealed {}
}

/// Unsigned integer types a parallel loop can be counted in.
pub trait LoopExtent: sealed::Sealed + Copy + Ord + Debug + Send + Sync + 'static {
    /// Width in bits.
    const BITS: u32;
    /// The value one.
    const ONE: Self;
    /// [`LARGE_GRAIN_CAP`] clamped to this type's range.
    const LARGE_GRAIN: Self;

    /// Widen losslessly.
    fn to_u128(self) -> u128;

    /// Narrow a value known to fit.
    fn from_u128(value: u128) -> Self;
}

macro_rules! impl_loop_extent {
    ($($t:ty),*) => {$(
        impl sealed::Sealed for $t {}

        impl LoopExtent for $t {
            const BITS: u32 = <$t>::BITS;
            const ONE: Self = 1;
            const LARGE_GRAIN: Self = if (<$t>::MAX as u128) < LARGE_GRAIN_CAP as u128 {
                <$t>::MAX
            } else {
                LARGE_GRAIN_CAP as $t
            };

            #[inline(always)]
            fn to_u128(self) -> u128 {
                self as u128
            }

            #[inline(always)]
            fn from_u128(value: u128) -> Self {
                debug_assert!(value <= <$t>::MAX as u128);
                value as $t
            }
        }
    )*};
}

impl_loop_extent!(u8, u16, u32, u64, usize);

/// Chunk size for a loop of `n` iterations over `workers` workers.
///
/// `n / (8 * workers)`, floored at 1 and capped at [`LoopExtent::LARGE_GRAIN`].
/// For `u8` the cap is 255, which `255 / 8` can never reach, so narrow loops
/// are effectively uncapped.
#[inline]
pub fn grainsize<T: LoopExtent>(
    n: T,
    workers: usize,
) -> Result<T, RtsError> {
    if workers == 0 {
        return Err(RtsError::NoWorkers);
    }
    let chunks = (CHUNKS_PER_WORKER as u128) * (workers as u128);
    let small = n.to_u128() / chunks;
    if small <= 1 {
        return Ok(T::ONE);
    }
    Ok(T::from_u128(small.min(T::LARGE_GRAIN.to_u128())))
}
