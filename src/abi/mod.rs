//! Binary interface shared with generated code and foreign runtimes
//!
//! - [`version`]: frame layout tag
//! - [`kmp`]: the tasking runtime's task descriptor and ident
//! - [`pack`]: copying captured data into aligned backend-owned storage

pub mod kmp;
pub mod pack;
pub mod version;

pub use kmp::{source_ident, Ident, KmpCmplrData, KmpRoutineEntry, KmpTask, TASK_TIED};
pub use pack::{align_ptr, align_up, pack_into, PackedArgs};
pub use version::{mix_offsets, verify_frame_version, FrameVersion, VersionedFrame, RTS_VERSION};
