//! Thread-start trampoline
//!
//! First frame of every intercepted thread. It copies the handoff record
//! out of the new region, installs the region as this thread's unsafe
//! stack, arms the cleanup key so the destructor passes will happen, then
//! becomes the caller's entry point.

use core::ffi::c_void;
use core::ptr::NonNull;
use crate::config::CLEANUP_ARMED;
use crate::error::OrDie;
use crate::handoff::ThreadHandoff;
use crate::thread_state;

/// Entry point handed to the real spawn primitive
pub extern "C" fn thread_start(arg: *mut c_void) -> *mut c_void {
    let record = match NonNull::new(arg.cast::<ThreadHandoff>()) {
        Some(record) => record,
        None => crate::chronicle::fatal(format_args!("thread started without a handoff record")),
    };

    // SAFETY: the interceptor placed this record and passed it to exactly
    // one spawn; this is its only reader. The record overlaps the top of
    // the stack we install next, so it is copied out first.
    let handoff = unsafe { ThreadHandoff::take(record) };
    let runtime = handoff.runtime;

    thread_state::install(handoff.region, runtime).or_die("installing thread unsafe stack");

    // The library only runs destructors for keys holding a non-null value
    runtime
        .host()
        .set_cleanup_value(runtime.cleanup_key(), CLEANUP_ARMED as *mut c_void)
        .or_die("arming unsafe stack cleanup");

    (handoff.start)(handoff.arg)
}
