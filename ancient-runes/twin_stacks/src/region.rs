//! # Unsafe Stack Regions
//!
//! Each thread's unsafe stack lives in its own mapping, with an
//! inaccessible guard directly below the usable part. An overflowing write
//! runs off the bottom into the guard and faults instead of reaching
//! anything else.
//!
//! ```text
//!   mapping start                base                         top
//!   |<------- guard_size ------->|<-------- usable_size -------->|
//!   [ no access                  ][ read / write   <- grows down ]
//! ```

use core::ptr::NonNull;
use crate::error::{WardError, WardResult};
use crate::mapper::{PageMapper, Protection};

/// A guarded unsafe stack mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct UnsafeStackRegion {
    base: NonNull<u8>,
    usable_size: usize,
    guard_size: usize,
}

// Safety: a region is a plain description of a mapping. It only crosses a
// thread boundary once, inside the handoff record, after which the new
// thread owns it exclusively.
unsafe impl Send for UnsafeStackRegion {}

impl UnsafeStackRegion {
    /// Describe an existing mapping
    ///
    /// # Safety
    /// `base - guard_size .. base + usable_size` must be one live mapping
    /// whose first `guard_size` bytes are inaccessible.
    pub const unsafe fn from_raw_parts(base: NonNull<u8>, usable_size: usize, guard_size: usize) -> Self {
        Self {
            base,
            usable_size,
            guard_size,
        }
    }

    /// Lowest usable address (just past the guard)
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// One past the highest usable address; the stack starts here
    pub fn top(&self) -> *mut u8 {
        self.base.as_ptr().wrapping_add(self.usable_size)
    }

    pub fn usable_size(&self) -> usize {
        self.usable_size
    }

    pub fn guard_size(&self) -> usize {
        self.guard_size
    }

    /// Start of the whole mapping, guard included
    pub fn mapping_start(&self) -> *mut u8 {
        self.base.as_ptr().wrapping_sub(self.guard_size)
    }

    /// Length of the whole mapping, guard included
    pub fn mapping_len(&self) -> usize {
        self.usable_size + self.guard_size
    }

    /// Check if an address falls in the usable part
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.base.as_ptr() as usize;
        addr >= base && addr < base + self.usable_size
    }

    /// Check if an address falls in the guard
    pub fn in_guard(&self, addr: usize) -> bool {
        let start = self.mapping_start() as usize;
        addr >= start && addr < self.base.as_ptr() as usize
    }

    /// Check if two regions share any byte of their mappings
    pub fn overlaps(&self, other: &UnsafeStackRegion) -> bool {
        let (a, b) = (self.mapping_start() as usize, other.mapping_start() as usize);
        a < b + other.mapping_len() && b < a + self.mapping_len()
    }
}

/// Map `size` usable bytes behind a `guard` byte no-access guard.
///
/// The returned region's base points just past the guard.
pub fn allocate(mapper: &dyn PageMapper, size: usize, guard: usize) -> WardResult<UnsafeStackRegion> {
    let total = size
        .checked_add(guard)
        .ok_or(WardError::SizeOverflow { size, guard })?;

    let start = mapper.map(total, Protection::read_write())?;
    if guard > 0 {
        // SAFETY: the guard is the first `guard` bytes of the mapping we
        // just created.
        if let Err(err) = unsafe { mapper.protect(start, guard, Protection::no_access()) } {
            if let Err(unmap_err) = unsafe { mapper.unmap(start, total) } {
                crate::ward_trace!("dropping half-built unsafe stack: {}", unmap_err);
            }
            return Err(err);
        }
    }

    // SAFETY: guard < total, so the base stays inside the mapping
    let base = unsafe { NonNull::new_unchecked(start.as_ptr().add(guard)) };
    crate::ward_trace!(
        "mapped unsafe stack {:#x}..{:#x} (guard {:#x})",
        base.as_ptr() as usize,
        base.as_ptr() as usize + size,
        guard
    );

    Ok(UnsafeStackRegion {
        base,
        usable_size: size,
        guard_size: guard,
    })
}

/// Unmap a region, guard included, in one operation.
///
/// # Safety
/// The region must have come from [`allocate`] with the same mapper and must
/// not be used again. Callers clear their copy afterwards.
pub unsafe fn release(mapper: &dyn PageMapper, region: UnsafeStackRegion) -> WardResult<()> {
    let start = NonNull::new_unchecked(region.mapping_start());
    mapper.unmap(start, region.mapping_len())?;
    crate::ward_trace!(
        "released unsafe stack {:#x}..{:#x}",
        region.base.as_ptr() as usize,
        region.top() as usize
    );
    Ok(())
}
