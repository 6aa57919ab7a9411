//! Argument packing
//!
//! A spawn copies the child's captured-data blob into storage the backend owns.
//! The storage is requested as `size + align` bytes with no alignment promise,
//! and the blob is written at the first aligned address inside it. The slack
//! guarantees that address plus `size` stays inside the region.
//!
//! # Precondition
//!
//! Every `align` passed here must be a power of two. This is checked with
//! `debug_assert!` only; a non-power-of-two alignment makes the mask below
//! round to the wrong address.

use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};
use std::slice;

use crate::util::error::RtsError;

/// Lowest address `>= addr` that is a multiple of `align`.
///
/// Computes `(addr + align - 1) & !(align - 1)` on the integer form of the address.
#[inline(always)]
pub const fn align_up(
    addr: usize,
    align: usize,
) -> usize {
    debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
    addr.wrapping_add(align - 1) & !(align - 1)
}

/// Pointer form of [`align_up`], preserving provenance of `base`.
#[inline(always)]
pub fn align_ptr(
    base: *mut u8,
    align: usize,
) -> *mut u8 {
    let addr = base as usize;
    base.wrapping_add(align_up(addr, align) - addr)
}

/// Size of the region a blob of `size` bytes at `align` is packed into.
#[inline]
pub fn padded_size(
    size: usize,
    align: usize,
) -> usize {
    match size.checked_add(align) {
        Some(total) => total,
        None => panic!("{}", RtsError::OutOfMemory { size, align }),
    }
}

/// Write a blob at the aligned address inside `region` and return that address.
///
/// # Safety
///
/// `region` must be valid for writes of `size + align` bytes, `data` valid for
/// reads of `size` bytes, and the two must not overlap.
#[inline(always)]
pub unsafe fn pack_into(
    region: *mut u8,
    data: *const u8,
    size: usize,
    align: usize,
) -> *mut u8 {
    let dst = align_ptr(region, align);
    if size > 0 {
        ptr::copy_nonoverlapping(data, dst, size);
    }
    dst
}

/// Heap-owned copy of a captured-data blob.
///
/// Owns `size + align` bytes from the global allocator; the blob lives at the
/// aligned offset inside. Dropping it frees the region.
#[derive(Debug)]
pub struct PackedArgs {
    base: NonNull<u8>,
    layout: Layout,
    offset: usize,
    len: usize,
}

// SAFETY: PackedArgs exclusively owns its allocation.
unsafe impl Send for PackedArgs {}

impl PackedArgs {
    /// Copy `data` into fresh storage aligned to `align`.
    pub fn new(
        data: &[u8],
        align: usize,
    ) -> Self {
        // SAFETY: the slice is valid for reads of its length.
        unsafe { Self::from_raw(data.as_ptr(), data.len(), align) }
    }

    /// Copy `size` bytes from `data` into fresh storage aligned to `align`.
    ///
    /// Allocation failure is fatal.
    ///
    /// # Safety
    ///
    /// `data` must be valid for reads of `size` bytes (it may dangle when `size` is 0).
    pub unsafe fn from_raw(
        data: *const u8,
        size: usize,
        align: usize,
    ) -> Self {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        let layout = match Layout::from_size_align(padded_size(size, align), 1) {
            Ok(layout) => layout,
            Err(_) => panic!("{}", RtsError::OutOfMemory { size, align }),
        };
        let Some(base) = NonNull::new(alloc::alloc(layout)) else {
            alloc::handle_alloc_error(layout)
        };
        let dst = pack_into(base.as_ptr(), data, size, align);
        Self {
            base,
            layout,
            offset: dst as usize - base.as_ptr() as usize,
            len: size,
        }
    }

    /// Aligned address of the blob.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        // SAFETY: offset < align, and the region holds size + align bytes.
        unsafe { self.base.as_ptr().add(self.offset) }
    }

    /// Blob length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the blob is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Offset of the blob from the start of the region.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The packed bytes.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: `len` bytes were copied to `as_ptr()` at construction.
        unsafe { slice::from_raw_parts(self.as_ptr(), self.len) }
    }
}

impl Drop for PackedArgs {
    fn drop(&mut self) {
        // SAFETY: allocated in from_raw with this layout.
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 + 7) as u8).collect()
    }

    #[test]
    fn test_align_up_table() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(9, 8), 16);
        assert_eq!(align_up(13, 1), 13);
        assert_eq!(align_up(65, 64), 128);
    }

    #[test]
    fn test_pack_into_region() {
        let mut region = [0u8; 32];
        let data = [1u8, 2, 3];
        let base = region.as_mut_ptr();
        // SAFETY: region holds 32 >= 3 + 16 bytes.
        let dst = unsafe { pack_into(base.wrapping_add(1), data.as_ptr(), 3, 16) };
        assert_eq!(dst as usize % 16, 0);
        let offset = dst as usize - base as usize;
        assert_eq!(&region[offset..offset + 3], &data);
    }

    #[test]
    fn test_packed_args_sizes_and_alignments() {
        for size in [0usize, 1, 7, 4096] {
            for align in [1usize, 8, 64] {
                let data = pattern(size);
                let packed = PackedArgs::new(&data, align);
                assert_eq!(packed.as_ptr() as usize % align, 0);
                assert!(packed.offset() < align);
                assert_eq!(packed.len(), size);
                assert_eq!(packed.as_bytes(), &data[..]);
            }
        }
    }

    #[test]
    fn test_packed_args_is_a_copy() {
        let mut data = pattern(16);
        let packed = PackedArgs::new(&data, 8);
        data.iter_mut().for_each(|b| *b = 0);
        assert_eq!(packed.as_bytes(), &pattern(16)[..]);
    }

    #[test]
    fn test_packed_args_empty_from_dangling() {
        // SAFETY: size 0 reads nothing.
        let packed = unsafe { PackedArgs::from_raw(NonNull::dangling().as_ptr(), 0, 32) };
        assert!(packed.is_empty());
        assert_eq!(packed.as_ptr() as usize % 32, 0);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "power of two")]
    fn test_non_power_of_two_rejected_in_debug() {
        align_up(10, 12);
    }

    proptest! {
        #[test]
        fn prop_align_up_bounds(base in 0usize..(1 << 40), shift in 0u32..13) {
            let align = 1usize << shift;
            let addr = align_up(base, align);
            prop_assert_eq!(addr % align, 0);
            prop_assert!(addr >= base);
            prop_assert!(addr - base < align);
        }

        #[test]
        fn prop_packed_round_trip(data in proptest::collection::vec(any::<u8>(), 0..512), shift in 0u32..8) {
            let align = 1usize << shift;
            let packed = PackedArgs::new(&data, align);
            prop_assert_eq!(packed.as_ptr() as usize % align, 0);
            prop_assert_eq!(packed.as_bytes(), &data[..]);
        }
    }
}
