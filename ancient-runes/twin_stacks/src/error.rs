//! Errors raised while weaving an unsafe stack.
//!
//! None of these ever reach the application. Inner operations return a
//! [`WardResult`] so they can be tested in isolation, and the outermost
//! entry points (initializer, interceptor, trampoline, destructor) turn any
//! error into a fatal abort with [`OrDie`].

use core::fmt;

/// A result type for unsafe stack operations
pub type WardResult<T> = Result<T, WardError>;

/// Everything that can go wrong while managing an unsafe stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WardError {
    /// A thread asked for a zero-sized stack
    ZeroStackSize,
    /// Stack size is not a multiple of the stack alignment
    MisalignedStackSize { size: usize },
    /// Guard size is not a multiple of the page size
    MisalignedGuardSize { guard: usize, page_size: usize },
    /// `size + guard` wraps around the address space
    SizeOverflow { size: usize, guard: usize },
    /// The region is too small to carry the thread handoff record
    HandoffOverflow { size: usize, needed: usize },
    /// The computed top of stack breaks the stack alignment
    MisalignedStackPointer { pointer: usize },
    /// Mapping the region failed
    MapFailed { len: usize, errno: i32 },
    /// Revoking access to the guard failed
    ProtectFailed { addr: usize, len: usize, errno: i32 },
    /// Unmapping the region failed
    UnmapFailed { addr: usize, len: usize, errno: i32 },
    /// Reading stack or guard size from thread attributes failed
    AttributeQueryFailed { code: i32 },
    /// Creating the cleanup key failed
    KeyCreateFailed { code: i32 },
    /// Arming the cleanup key failed
    KeySetFailed { code: i32 },
    /// The real thread-spawn primitive could not be resolved
    InterceptionFailed,
    /// The initializer ran a second time
    AlreadyInitialized,
    /// Interception was used before the initializer finished
    NotReady,
}

impl fmt::Display for WardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            WardError::ZeroStackSize => write!(f, "stack size is zero"),
            WardError::MisalignedStackSize { size } => {
                write!(f, "stack size {:#x} is not {}-byte aligned", size, crate::config::STACK_ALIGN)
            }
            WardError::MisalignedGuardSize { guard, page_size } => {
                write!(f, "guard size {:#x} is not a multiple of the page size {:#x}", guard, page_size)
            }
            WardError::SizeOverflow { size, guard } => {
                write!(f, "stack size {:#x} plus guard {:#x} overflows", size, guard)
            }
            WardError::HandoffOverflow { size, needed } => {
                write!(f, "stack of {} bytes cannot hold a {} byte handoff record", size, needed)
            }
            WardError::MisalignedStackPointer { pointer } => {
                write!(f, "unsafe stack pointer {:#x} is misaligned", pointer)
            }
            WardError::MapFailed { len, errno } => {
                write!(f, "mapping {:#x} bytes failed (errno {})", len, errno)
            }
            WardError::ProtectFailed { addr, len, errno } => {
                write!(f, "protecting guard {:#x}+{:#x} failed (errno {})", addr, len, errno)
            }
            WardError::UnmapFailed { addr, len, errno } => {
                write!(f, "unmapping {:#x}+{:#x} failed (errno {})", addr, len, errno)
            }
            WardError::AttributeQueryFailed { code } => {
                write!(f, "reading thread attributes failed (code {})", code)
            }
            WardError::KeyCreateFailed { code } => {
                write!(f, "creating the cleanup key failed (code {})", code)
            }
            WardError::KeySetFailed { code } => {
                write!(f, "arming the cleanup key failed (code {})", code)
            }
            WardError::InterceptionFailed => write!(f, "real pthread_create could not be resolved"),
            WardError::AlreadyInitialized => write!(f, "runtime initialized twice"),
            WardError::NotReady => write!(f, "thread creation intercepted before initialization"),
        }
    }
}

/// Turn a [`WardResult`] into its value or a fatal abort.
///
/// There is no degraded mode: a thread without a protected unsafe stack is
/// a silent security downgrade.
pub trait OrDie<T> {
    fn or_die(self, what: &str) -> T;
}

impl<T> OrDie<T> for WardResult<T> {
    #[inline]
    fn or_die(self, what: &str) -> T {
        match self {
            Ok(value) => value,
            Err(err) => crate::chronicle::fatal(format_args!("{}: {}", what, err)),
        }
    }
}
