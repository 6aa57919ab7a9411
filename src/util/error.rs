//! Error types for the backend layer
//!
//! Almost nothing here is recoverable. `RtsError` covers the few conditions a
//! caller can observe as a value; everything past that boundary is fatal.

use std::any::Any;
use std::fmt;
use std::panic;

use crate::util::config::ConfigError;

/// Result alias used across the crate.
pub type Result<T, E = RtsError> = std::result::Result<T, E>;

/// Backend layer error
#[derive(Debug, thiserror::Error)]
pub enum RtsError {
    /// `enter_scope` was called on a thread that belongs to no worker pool
    #[error("no worker context: enter_scope called outside an active worker pool")]
    NoWorkerContext,

    /// Grainsize requested while the pool reports zero workers
    #[error("worker pool reports zero workers")]
    NoWorkers,

    /// Backend-owned storage for a captured-data blob could not be obtained
    #[error("out of memory packing {size} bytes at alignment {align}")]
    OutOfMemory { size: usize, align: usize },

    /// Frame layout tag differs between caller and adapter
    #[error("frame ABI mismatch: expected tag {expected}, found {found}")]
    AbiMismatch { expected: u32, found: u32 },

    /// A task panicked under a runtime that cannot carry the unwind
    #[error("task panicked where the runtime cannot unwind: {0}")]
    ContainedPanic(String),

    /// Worker pool could not be started
    #[error("failed to build worker pool: {0}")]
    PoolBuild(String),

    /// Configuration could not be loaded
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// An unwind captured from a spawned task.
///
/// Holds the original payload so `sync` can resume it on the joining thread.
pub struct ChildPanic {
    payload: Box<dyn Any + Send + 'static>,
}

impl ChildPanic {
    /// Wrap a payload returned by `catch_unwind`.
    #[inline]
    pub fn new(payload: Box<dyn Any + Send + 'static>) -> Self {
        Self { payload }
    }

    /// Best-effort rendering of the panic message.
    pub fn message(&self) -> &str {
        if let Some(s) = self.payload.downcast_ref::<&'static str>() {
            s
        } else if let Some(s) = self.payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "<non-string panic payload>"
        }
    }

    /// Continue unwinding on the current thread.
    pub fn resume(self) -> ! {
        panic::resume_unwind(self.payload)
    }
}

impl fmt::Debug for ChildPanic {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ChildPanic")
            .field("message", &self.message())
            .finish()
    }
}

impl fmt::Display for ChildPanic {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "spawned task panicked: {}", self.message())
    }
}

/// Log and abort the process.
///
/// Used at the C boundary where there is no caller to hand an error back to.
#[cold]
pub fn fatal(err: RtsError) -> ! {
    tracing::error!("fatal: {}", err);
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_panic_message_str() {
        let payload = panic::catch_unwind(|| panic!("boom")).unwrap_err();
        let child = ChildPanic::new(payload);
        assert_eq!(child.message(), "boom");
        assert_eq!(child.to_string(), "spawned task panicked: boom");
    }

    #[test]
    fn test_child_panic_message_string() {
        let payload = panic::catch_unwind(|| panic!("bad index {}", 3)).unwrap_err();
        assert_eq!(ChildPanic::new(payload).message(), "bad index 3");
    }

    #[test]
    fn test_child_panic_resume() {
        let payload = panic::catch_unwind(|| panic!("first")).unwrap_err();
        let child = ChildPanic::new(payload);
        let again = panic::catch_unwind(panic::AssertUnwindSafe(|| child.resume())).unwrap_err();
        assert_eq!(ChildPanic::new(again).message(), "first");
    }

    #[test]
    fn test_error_display() {
        let err = RtsError::AbiMismatch {
            expected: 173,
            found: 177,
        };
        assert_eq!(
            err.to_string(),
            "frame ABI mismatch: expected tag 173, found 177"
        );
        assert_eq!(
            RtsError::OutOfMemory { size: 16, align: 8 }.to_string(),
            "out of memory packing 16 bytes at alignment 8"
        );
    }
}
