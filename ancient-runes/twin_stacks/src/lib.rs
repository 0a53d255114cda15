//! # Twin Stacks - Unsafe Stack Runtime
//!
//! Runtime support for the compiler's safe-stack protection. Every thread
//! runs on two stacks: the ordinary (safe) stack keeps return addresses and
//! values the compiler proved cannot be overrun, and a separate unsafe
//! stack holds everything else. The unsafe stack lives in its own mapping
//! behind a guard, so an overflowing buffer faults instead of reaching a
//! return address.
//!
//! This crate manages the unsafe stacks' lifetime:
//! - the main thread's stack, set up before any other initializer runs
//! - one stack per spawned thread, attached by intercepting thread creation
//! - release of each thread's stack on the very last destructor pass, after
//!   other thread-local destructors that may still be running on it
//!
//! ## Philosophy
//! A thread's unsafe stack is its outer wall. We never let a thread run
//! without one, and we never take it down while anyone may still stand on
//! it.
//!
//! ## Non-goals
//! The safe stack itself is not hidden or isolated (no segmentation, no
//! pointer hiding), and the stack pointer slot is an ordinary thread local
//! rather than a field of the thread control block.

#![cfg_attr(feature = "interpose", feature(thread_local))]

pub mod chronicle;  // Diagnostic output and fatal reporting
pub mod config;
pub mod error;
pub mod mapper;  // Page map/protect/unmap seam
pub mod host;  // Threading seam (pthreads)
pub mod region;
pub mod thread_state;
pub mod handoff;
pub mod cleanup;  // Destructor-ordering protocol
pub mod interceptor;
pub mod trampoline;
pub mod runtime;

#[cfg(feature = "interpose")]
pub mod interpose;  // Exported C ABI

#[cfg(test)]
mod mock;

// Re-export key types
pub use error::{OrDie, WardError, WardResult};
pub use host::{CleanupKey, PthreadHost, StackAttributes, StartRoutine, ThreadHost};
pub use mapper::{PageMapper, Protection, SystemMapper};
pub use region::UnsafeStackRegion;
pub use runtime::{Phase, Runtime, SYSTEM};
pub use thread_state::{current_base, current_guard_size, current_pointer, current_region, current_top};
