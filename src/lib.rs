//! forkjoin-rts
//!
//! A pluggable fork-join task backend. Generated code enters a scope, spawns
//! children with a captured-data blob, syncs, and asks for loop grainsizes;
//! this crate maps those calls onto one of two task runtimes chosen at build
//! time.
//!
//! # Example
//!
//! ```no_run
//! use forkjoin_rts::backend::{ActiveBackend, Backend};
//! use forkjoin_rts::parallel::par_do;
//!
//! fn fib(n: u64) -> u64 {
//!     if n < 2 {
//!         return n;
//!     }
//!     let (a, b) = par_do::<ActiveBackend, _, _, _, _>(|| fib(n - 1), || fib(n - 2)).unwrap();
//!     a + b
//! }
//!
//! let value = ActiveBackend::with_workers(4, || fib(20)).unwrap();
//! assert_eq!(value, 6765);
//! ```
//!
//! # Crate Features
//!
//! - `task-group`: wire the rayon task-group adapter to the C surface
//! - `libomp`: drive the tasking adapter with the system libomp

#![warn(rust_2018_idioms)]

pub mod abi;
pub mod backend;
pub mod ffi;
pub mod parallel;
pub mod runtime;

// Utility modules
pub mod util;

// Re-exports
pub use backend::{ActiveBackend, Backend, ChildBody, TaskGroupBackend, Tasking};
pub use parallel::{par_do, parallel_for, ScopeGuard};
pub use util::error::{ChildPanic, Result, RtsError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
