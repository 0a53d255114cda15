//! # Exported C ABI
//!
//! Symbols the compiler's safe-stack instrumentation and its tooling
//! expect, plus the `pthread_create` override. Linked into an executable,
//! the override shadows the C library's definition and the initializer
//! runs from `.preinit_array`, ahead of every other constructor.
//!
//! The stack pointer slot itself, `__safestack_unsafe_stack_ptr`, is
//! defined in [`crate::thread_state`].

use core::ffi::c_void;
use libc::{c_int, pthread_attr_t, pthread_t};
use crate::host::StartRoutine;
use crate::runtime::SYSTEM;
use crate::thread_state;

/// Set up the main thread's unsafe stack and thread interception
#[no_mangle]
pub extern "C" fn __safestack_init() {
    SYSTEM.init();
}

/// Runs `__safestack_init` before any other initializer
#[cfg(target_os = "linux")]
#[used]
#[link_section = ".preinit_array"]
static __SAFESTACK_PREINIT: extern "C" fn() = __safestack_init;

/// Interposed thread creation
#[no_mangle]
pub unsafe extern "C" fn pthread_create(
    thread: *mut pthread_t,
    attr: *const pthread_attr_t,
    start: StartRoutine,
    arg: *mut c_void,
) -> c_int {
    SYSTEM.intercept_spawn(thread, attr, start, arg)
}

/// Lowest usable address of the calling thread's unsafe stack
#[no_mangle]
pub extern "C" fn __get_unsafe_stack_start() -> *mut c_void {
    thread_state::current_base().cast()
}

/// Same as [`__get_unsafe_stack_start`]
#[no_mangle]
pub extern "C" fn __get_unsafe_stack_bottom() -> *mut c_void {
    thread_state::current_base().cast()
}

/// One past the highest usable address of the calling thread's unsafe stack
#[no_mangle]
pub extern "C" fn __get_unsafe_stack_top() -> *mut c_void {
    thread_state::current_top().cast()
}

/// Current unsafe stack pointer of the calling thread
#[no_mangle]
pub extern "C" fn __get_unsafe_stack_ptr() -> *mut c_void {
    thread_state::current_pointer().cast()
}
