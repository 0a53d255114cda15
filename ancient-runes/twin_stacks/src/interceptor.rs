//! Thread-creation interception
//!
//! Every spawn gets its unsafe stack here, on the creating thread. The
//! caller's attributes decide the geometry, the handoff record goes into
//! the new region, and the real spawn primitive starts the trampoline
//! instead of the caller's entry point. The caller's own `pthread_t` and
//! attributes pass through untouched.

use core::ffi::c_void;
use core::ptr::NonNull;
use libc::{c_int, pthread_attr_t, pthread_t};
use crate::config::STACK_ALIGN;
use crate::error::{OrDie, WardError, WardResult};
use crate::handoff::ThreadHandoff;
use crate::host::{StackAttributes, StartRoutine};
use crate::region;
use crate::runtime::Runtime;
use crate::trampoline;

/// Reject geometry the runtime cannot honour.
///
/// Any failure here means the platform and its attributes disagree with
/// the runtime, which is an integrity failure rather than a caller error.
pub fn validate_attributes(attributes: StackAttributes, page_size: usize) -> WardResult<()> {
    if attributes.size == 0 {
        return Err(WardError::ZeroStackSize);
    }
    if attributes.size & (STACK_ALIGN - 1) != 0 {
        return Err(WardError::MisalignedStackSize {
            size: attributes.size,
        });
    }
    if attributes.guard_size & (page_size - 1) != 0 {
        return Err(WardError::MisalignedGuardSize {
            guard: attributes.guard_size,
            page_size,
        });
    }
    Ok(())
}

impl Runtime {
    /// Replacement for `pthread_create`.
    ///
    /// Returns whatever the real spawn primitive returns.
    ///
    /// # Safety
    /// Same contract as `pthread_create`.
    pub unsafe fn intercept_spawn(
        &'static self,
        thread: *mut pthread_t,
        attr: *const pthread_attr_t,
        start: StartRoutine,
        arg: *mut c_void,
    ) -> c_int {
        crate::ward_check!(self.is_ready(), "{}", WardError::NotReady);

        let record = self
            .prepare_spawn(attr, start, arg)
            .or_die("preparing thread unsafe stack");

        let code = self
            .host()
            .spawn(thread, attr, trampoline::thread_start, record.as_ptr().cast());
        if code != 0 {
            // No thread will ever take the record
            let handoff = ThreadHandoff::take(record);
            region::release(self.mapper(), handoff.region).or_die("releasing unused unsafe stack");
        }
        code
    }

    /// Size, map and fill a new thread's region; returns the handoff record
    ///
    /// # Safety
    /// `attr` must be null or point to an initialised attribute object.
    pub unsafe fn prepare_spawn(
        &'static self,
        attr: *const pthread_attr_t,
        start: StartRoutine,
        arg: *mut c_void,
    ) -> WardResult<NonNull<ThreadHandoff>> {
        let attributes = if attr.is_null() {
            self.host().default_attributes()?
        } else {
            self.host().requested_attributes(attr)?
        };
        validate_attributes(attributes, self.mapper().page_size())?;

        let region = region::allocate(self.mapper(), attributes.size, attributes.guard_size)?;
        let handoff = ThreadHandoff {
            start,
            arg,
            region,
            runtime: self,
        };
        match handoff.place() {
            Ok(record) => {
                crate::ward_trace!(
                    "spawning with unsafe stack {:#x}..{:#x}",
                    region.base().as_ptr() as usize,
                    region.top() as usize
                );
                Ok(record)
            }
            Err(err) => {
                if let Err(unmap_err) = region::release(self.mapper(), region) {
                    crate::ward_trace!("dropping unused unsafe stack: {}", unmap_err);
                }
                Err(err)
            }
        }
    }
}
