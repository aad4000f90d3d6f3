//! A minimal single-threaded stackful coroutine runtime.
//!
//! Each coroutine owns a private, guard-paged stack and a full register
//! snapshot. Control moves between the caller and a coroutine through an
//! exact, symmetric context swap written in assembly; everything above that
//! one primitive is ordinary safe code. Multitasking is cooperative only:
//! a coroutine runs until it calls [`yield_value`] or [`exit`], and
//! [`resume`] blocks its caller until then.
//!
//! Every thread gets its own independent coroutine registry. Handles are
//! meaningless on any thread other than the one that created them.
//!
//! # Example
//!
//! ```
//! use stackling::{create, destroy, exit, resume, yield_value, Coroutine, FINISHED};
//!
//! fn worker(coro: Coroutine) {
//!     yield_value(coro, 1);
//!     yield_value(coro, 2);
//!     exit(coro, 0);
//! }
//!
//! let coro = create(worker, 16 * 1024).unwrap();
//! assert_eq!(resume(coro), 1);
//! assert_eq!(resume(coro), 2);
//! assert_eq!(resume(coro), 0);
//! assert_eq!(resume(coro), FINISHED);
//! destroy(coro);
//! ```

mod runtime;

pub use runtime::{create, destroy, exit, resume, yield_value, Coroutine, EntryFn, FINISHED};

/// Failure to create a coroutine.
///
/// Creation is the only fallible operation; everything after it either
/// succeeds or is a usage error that panics.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The stack for the new coroutine could not be mapped.
    #[error("failed to allocate coroutine stack: {0}")]
    StackAllocation(#[from] std::io::Error),
}
