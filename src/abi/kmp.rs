//! Foreign tasking-runtime ABI
//!
//! These records are shared with an OpenMP tasking runtime (`__kmpc_*` entry
//! points). Their layout belongs to that runtime and is reproduced field for
//! field; the assertions at the bottom pin every offset. Nothing in this crate
//! reads or writes them except through the adapter and the team runtime.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::fmt;
use std::mem::{offset_of, size_of};

use once_cell::sync::OnceCell;

use crate::util::config::{self, IdentConfig};

/// Task routine: `int (*)(int gtid, void *task)`.
///
/// The runtime passes the descriptor itself as the second argument; the routine
/// locates its captured data through [`KmpTask::shareds`].
pub type KmpRoutineEntry = unsafe extern "C-unwind" fn(gtid: c_int, task: *mut c_void) -> c_int;

/// Allocation flag: task is tied to the thread that starts it.
pub const TASK_TIED: c_int = 1;

/// Default ident source string.
pub const DEFAULT_IDENT_SOURCE: &CStr = c"omp-task-rt-abi";

/// Source-location descriptor passed to every runtime call (`ident_t`).
#[repr(C)]
pub struct Ident {
    pub reserved_1: c_int,
    pub flags: c_int,
    pub reserved_2: c_int,
    pub reserved_3: c_int,
    pub psource: *const c_char,
}

// SAFETY: an Ident is immutable after construction and `psource` points at a
// 'static NUL-terminated string.
unsafe impl Send for Ident {}
unsafe impl Sync for Ident {}

impl Ident {
    /// Build an ident with the fixed reserved words the adapter always uses.
    pub const fn new(
        flags: c_int,
        source: &'static CStr,
    ) -> Self {
        Self {
            reserved_1: 0,
            flags,
            reserved_2: 0,
            reserved_3: 22,
            psource: source.as_ptr(),
        }
    }

    /// Build from configuration. The source string is leaked; this runs once.
    pub fn from_config(config: &IdentConfig) -> Self {
        match CString::new(config.source.clone()) {
            Ok(source) => Self::new(config.flags, Box::leak(source.into_boxed_c_str())),
            Err(_) => {
                tracing::warn!(
                    "ident source {:?} contains NUL, using {:?}",
                    config.source,
                    DEFAULT_IDENT_SOURCE
                );
                Self::new(config.flags, DEFAULT_IDENT_SOURCE)
            },
        }
    }

    /// Source string.
    pub fn source(&self) -> &CStr {
        // SAFETY: constructors only store pointers taken from 'static CStrs.
        unsafe { CStr::from_ptr(self.psource) }
    }
}

impl Default for Ident {
    fn default() -> Self {
        Self::new(2, DEFAULT_IDENT_SOURCE)
    }
}

impl fmt::Debug for Ident {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Ident")
            .field("flags", &self.flags)
            .field("reserved_3", &self.reserved_3)
            .field("psource", &self.source())
            .finish()
    }
}

/// The process-wide ident, built from [`config::global`] on first use.
///
/// Callers fetch it once per operation and pass the reference explicitly to
/// each runtime entry point.
pub fn source_ident() -> &'static Ident {
    static IDENT: OnceCell<Ident> = OnceCell::new();
    IDENT.get_or_init(|| Ident::from_config(&config::global().ident))
}

/// `kmp_cmplrdata_t`: priority or destructor thunk depending on task kind.
#[repr(C)]
#[derive(Clone, Copy)]
pub union KmpCmplrData {
    pub priority: c_int,
    pub destructors: Option<KmpRoutineEntry>,
}

impl KmpCmplrData {
    /// Zeroed slot (priority 0, no destructor).
    #[inline]
    pub const fn zeroed() -> Self {
        Self { destructors: None }
    }
}

/// `kmp_task_t`: the public head of a task descriptor.
#[repr(C)]
pub struct KmpTask {
    /// Payload region, at least `sizeof_shareds` usable bytes.
    pub shareds: *mut c_void,
    /// Entry point invoked as `routine(gtid, task)`.
    pub routine: Option<KmpRoutineEntry>,
    /// Partition / continuation id.
    pub part_id: c_int,
    pub data1: KmpCmplrData,
    pub data2: KmpCmplrData,
}

impl fmt::Debug for KmpTask {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("KmpTask")
            .field("shareds", &self.shareds)
            .field("routine", &self.routine.map(|r| r as *const ()))
            .field("part_id", &self.part_id)
            .finish_non_exhaustive()
    }
}

const PTR: usize = size_of::<*mut c_void>();

const _: () = {
    assert!(offset_of!(KmpTask, shareds) == 0);
    assert!(offset_of!(KmpTask, routine) == PTR);
    assert!(offset_of!(KmpTask, part_id) == 2 * PTR);
    assert!(offset_of!(KmpTask, data1) == 3 * PTR);
    assert!(offset_of!(KmpTask, data2) == 4 * PTR);
    assert!(size_of::<KmpTask>() == 5 * PTR);
    assert!(size_of::<KmpCmplrData>() == PTR);

    assert!(offset_of!(Ident, flags) == 4);
    assert!(offset_of!(Ident, reserved_3) == 12);
    assert!(offset_of!(Ident, psource) == 16);
};
