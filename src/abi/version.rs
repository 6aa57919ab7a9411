//! Frame version tag
//!
//! Every frame descriptor carries a tag folded from the byte offsets of its own
//! fields. Generated code and the adapter each compute the tag from the layout
//! they were compiled against, so a reordered or widened frame changes the
//! value and a stale artifact is caught before it writes through the frame.
//!
//! The fold starts at [`RTS_VERSION`] and, per field, multiplies by
//! [`VERSION_MIX`] and adds the offset. The multiply makes it order sensitive:
//! swapping two fields gives a different tag.

use crate::util::error::RtsError;

/// Baseline of the fold. Bumped whenever the frame contract changes.
pub const RTS_VERSION: u32 = 1;

/// Odd multiplier applied before each offset is added.
pub const VERSION_MIX: u32 = 13;

/// Fold field offsets into a tag.
pub const fn mix_offsets(offsets: &[usize]) -> u32 {
    let mut acc = RTS_VERSION;
    let mut i = 0;
    while i < offsets.len() {
        acc = acc.wrapping_mul(VERSION_MIX).wrapping_add(offsets[i] as u32);
        i += 1;
    }
    acc
}

/// Layout tag embedded at the start of every frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameVersion {
    version_number: u32,
}

impl FrameVersion {
    /// Tag for a frame whose fields sit at `offsets`, in declaration order.
    #[inline]
    pub const fn from_offsets(offsets: &[usize]) -> Self {
        Self {
            version_number: mix_offsets(offsets),
        }
    }

    /// Wrap a raw tag, e.g. one read from generated code.
    #[inline]
    pub const fn from_raw(version_number: u32) -> Self {
        Self { version_number }
    }

    /// Raw tag value.
    #[inline]
    pub const fn get(self) -> u32 {
        self.version_number
    }

    /// Compare against the tag the other side of the ABI computed.
    pub fn verify(
        self,
        expected: FrameVersion,
    ) -> Result<(), RtsError> {
        if self == expected {
            Ok(())
        } else {
            Err(RtsError::AbiMismatch {
                expected: expected.get(),
                found: self.get(),
            })
        }
    }
}

/// A frame descriptor with an embedded layout tag.
pub trait VersionedFrame {
    /// Tag computed from this frame type's declared layout.
    const VERSION: FrameVersion;

    /// Tag stored in this frame instance.
    fn version(&self) -> FrameVersion;
}

/// Check a tag baked into generated code against the adapter's frame type.
pub fn verify_frame_version<F: VersionedFrame>(found: u32) -> Result<(), RtsError> {
    FrameVersion::from_raw(found).verify(F::VERSION)
}

/// Check the tag stored in a live frame against its type's layout.
#[inline]
pub fn verify_frame<F: VersionedFrame>(frame: &F) -> Result<(), RtsError> {
    frame.version().verify(F::VERSION)
}
