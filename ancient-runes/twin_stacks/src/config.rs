//! Runtime constants and environment configuration.
//!
//! Everything here must be readable before `main` runs, so the environment
//! is consulted through `libc::getenv` rather than `std::env`.

use crate::chronicle::Verbosity;

/// Minimum alignment of the unsafe stack pointer
pub const STACK_ALIGN: usize = 16;

/// Size of the main thread's unsafe stack when `RLIMIT_STACK` is unlimited
pub const DEFAULT_UNSAFE_STACK_SIZE: usize = 0x280_0000;

/// Number of key destructor passes the C library guarantees
/// (`PTHREAD_DESTRUCTOR_ITERATIONS` on glibc and musl)
pub const DESTRUCTOR_ITERATIONS: usize = 4;

/// Value stored in the cleanup key when a thread starts
pub const CLEANUP_ARMED: usize = 1;

/// Environment variable controlling diagnostic output
pub const LOG_ENV: &[u8] = b"TWIN_STACKS_LOG\0";

/// Settings gathered once by the initializer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub verbosity: Verbosity,
}

impl RuntimeConfig {
    pub const fn new() -> Self {
        Self {
            verbosity: Verbosity::Quiet,
        }
    }

    /// Read the configuration from the process environment
    pub fn from_environment() -> Self {
        // SAFETY: LOG_ENV is NUL-terminated; getenv returns either null or
        // a pointer into the environment block that outlives this call.
        let raw = unsafe { libc::getenv(LOG_ENV.as_ptr().cast()) };
        if raw.is_null() {
            return Self::new();
        }

        let value = unsafe { core::ffi::CStr::from_ptr(raw) };
        Self::from_value(value.to_bytes())
    }

    /// Parse a `TWIN_STACKS_LOG` value; anything unknown stays quiet
    pub fn from_value(value: &[u8]) -> Self {
        let verbosity = match value {
            b"trace" | b"2" => Verbosity::Trace,
            b"notice" | b"1" => Verbosity::Notice,
            _ => Verbosity::Quiet,
        };
        Self { verbosity }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}
