//! Thread handoff record
//!
//! The creating thread has to pass the entry point, its argument and the
//! new region across the spawn boundary without allocating. The record is
//! written into the top of the new region itself, ending exactly at the
//! region's top, and the trampoline reads it back once. After that read the
//! bytes are just unused unsafe stack.
//!
//! The spawn primitive orders the creator's writes before the new thread's
//! first instruction, so no extra synchronization is involved.

use core::ffi::c_void;
use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};
use crate::error::{WardError, WardResult};
use crate::host::StartRoutine;
use crate::region::UnsafeStackRegion;
use crate::runtime::Runtime;

/// Startup parameters for an intercepted thread
#[repr(C)]
pub struct ThreadHandoff {
    pub start: StartRoutine,
    pub arg: *mut c_void,
    pub region: UnsafeStackRegion,
    pub runtime: &'static Runtime,
}

impl ThreadHandoff {
    /// Where the record goes in `region`: flush against the top
    pub fn slot_in(region: &UnsafeStackRegion) -> WardResult<NonNull<ThreadHandoff>> {
        let needed = size_of::<ThreadHandoff>();
        if region.usable_size() < needed {
            return Err(WardError::HandoffOverflow {
                size: region.usable_size(),
                needed,
            });
        }

        let addr = region.top() as usize - needed;
        crate::ward_check!(
            addr % align_of::<ThreadHandoff>() == 0,
            "handoff record at {:#x} is misaligned",
            addr
        );
        // SAFETY: addr lies inside the usable part of the region
        Ok(unsafe { NonNull::new_unchecked(addr as *mut ThreadHandoff) })
    }

    /// Write the record into its region and return where it landed
    ///
    /// # Safety
    /// `self.region` must be mapped read/write and not yet in use as a stack.
    pub unsafe fn place(self) -> WardResult<NonNull<ThreadHandoff>> {
        let slot = Self::slot_in(&self.region)?;
        ptr::write(slot.as_ptr(), self);
        Ok(slot)
    }

    /// Read the record back and scrub its bytes. One shot: the memory
    /// belongs to the unsafe stack from here on.
    ///
    /// # Safety
    /// `record` must come from [`ThreadHandoff::place`] and not have been
    /// taken before.
    pub unsafe fn take(record: NonNull<ThreadHandoff>) -> ThreadHandoff {
        let handoff = ptr::read(record.as_ptr());
        ptr::write_bytes(record.as_ptr().cast::<u8>(), 0, size_of::<ThreadHandoff>());
        handoff
    }
}
