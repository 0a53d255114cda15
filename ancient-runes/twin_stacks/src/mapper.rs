//! # Page Mapping
//!
//! The memory primitives the runtime stands on: map an anonymous range,
//! change its protection, give it back. [`PageMapper`] is the seam; the
//! [`SystemMapper`] speaks to the kernel through `mmap`/`mprotect`/`munmap`.

use core::ptr::NonNull;
use crate::error::{WardError, WardResult};

bitflags::bitflags! {
    /// Access rights for a mapped range; empty means no access at all
    pub struct Protection: u32 {
        const READ    = 0b001;
        const WRITE   = 0b010;
        const EXECUTE = 0b100;
    }
}

impl Protection {
    /// Ordinary stack memory
    pub fn read_write() -> Self {
        Self::READ | Self::WRITE
    }

    /// Guard pages
    pub fn no_access() -> Self {
        Self::empty()
    }

    fn to_prot(self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.contains(Self::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Self::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(Self::EXECUTE) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

/// Page-granular virtual memory operations
pub trait PageMapper: Sync {
    /// Hardware page size in bytes
    fn page_size(&self) -> usize;

    /// Map `len` bytes of fresh anonymous memory
    fn map(&self, len: usize, protection: Protection) -> WardResult<NonNull<u8>>;

    /// Change the protection of `[addr, addr + len)`
    ///
    /// # Safety
    /// The range must lie inside a mapping owned by the caller.
    unsafe fn protect(&self, addr: NonNull<u8>, len: usize, protection: Protection) -> WardResult<()>;

    /// Unmap `[addr, addr + len)`
    ///
    /// # Safety
    /// The range must be a mapping owned by the caller and nothing may touch
    /// it afterwards.
    unsafe fn unmap(&self, addr: NonNull<u8>, len: usize) -> WardResult<()>;
}

/// Kernel-backed mapper
#[derive(Debug, Default)]
pub struct SystemMapper;

impl SystemMapper {
    pub const fn new() -> Self {
        SystemMapper
    }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

impl PageMapper for SystemMapper {
    fn page_size(&self) -> usize {
        // SAFETY: sysconf has no preconditions
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size <= 0 {
            4096
        } else {
            size as usize
        }
    }

    fn map(&self, len: usize, protection: Protection) -> WardResult<NonNull<u8>> {
        let addr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                protection.to_prot(),
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(WardError::MapFailed { len, errno: last_errno() });
        }
        NonNull::new(addr.cast::<u8>()).ok_or(WardError::MapFailed { len, errno: 0 })
    }

    unsafe fn protect(&self, addr: NonNull<u8>, len: usize, protection: Protection) -> WardResult<()> {
        if libc::mprotect(addr.as_ptr().cast(), len, protection.to_prot()) != 0 {
            return Err(WardError::ProtectFailed {
                addr: addr.as_ptr() as usize,
                len,
                errno: last_errno(),
            });
        }
        Ok(())
    }

    unsafe fn unmap(&self, addr: NonNull<u8>, len: usize) -> WardResult<()> {
        if libc::munmap(addr.as_ptr().cast(), len) != 0 {
            return Err(WardError::UnmapFailed {
                addr: addr.as_ptr() as usize,
                len,
                errno: last_errno(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protection_flags() {
        assert_eq!(Protection::no_access().to_prot(), libc::PROT_NONE);
        assert_eq!(Protection::read_write().to_prot(), libc::PROT_READ | libc::PROT_WRITE);
        assert!(!Protection::read_write().contains(Protection::EXECUTE));
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        let page = SystemMapper::new().page_size();
        assert!(page >= 4096);
        assert!(page.is_power_of_two());
    }

    #[test]
    fn test_map_write_unmap() {
        let mapper = SystemMapper::new();
        let page = mapper.page_size();
        let addr = mapper.map(2 * page, Protection::read_write()).expect("map failed");
        assert_eq!(addr.as_ptr() as usize % page, 0);

        unsafe {
            addr.as_ptr().write(0xAA);
            addr.as_ptr().add(2 * page - 1).write(0x55);
            assert_eq!(addr.as_ptr().read(), 0xAA);
            mapper.unmap(addr, 2 * page).expect("unmap failed");
        }
    }

    #[test]
    fn test_map_absurd_length_fails() {
        let err = SystemMapper::new().map(usize::MAX & !0xfff, Protection::read_write()).unwrap_err();
        assert!(matches!(err, WardError::MapFailed { .. }));
    }
}
