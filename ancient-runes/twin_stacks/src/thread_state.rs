//! # Per-Thread Stack State
//!
//! Two kinds of thread-local state live here.
//!
//! - **The stack pointer slot.** Compiled code reads and writes it on every
//!   unsafe frame push and pop, so it is the one piece of hot, genuinely
//!   global state. Only [`install`], [`take`] and compiled prologues and
//!   epilogues write it. With the `interpose` feature it is the exported
//!   ELF TLS symbol `__safestack_unsafe_stack_ptr`.
//! - **Bookkeeping.** The region backing the slot and the runtime that owns
//!   it. Rarely touched, so ordinary thread locals are fine.
//!
//! Neither kind needs a destructor, so both stay readable during the key
//! destructor passes at thread exit.

use core::cell::Cell;
use core::ptr;
use crate::config::STACK_ALIGN;
use crate::error::{WardError, WardResult};
use crate::region::UnsafeStackRegion;
use crate::runtime::Runtime;

/// Unsafe stack pointer consulted by compiled code
#[cfg(feature = "interpose")]
#[allow(non_upper_case_globals)]
#[no_mangle]
#[thread_local]
pub static mut __safestack_unsafe_stack_ptr: *mut core::ffi::c_void = ptr::null_mut();

#[cfg(feature = "interpose")]
mod slot {
    #[inline(always)]
    pub fn get() -> *mut u8 {
        unsafe { super::__safestack_unsafe_stack_ptr.cast() }
    }

    #[inline(always)]
    pub fn set(pointer: *mut u8) {
        unsafe { super::__safestack_unsafe_stack_ptr = pointer.cast() }
    }
}

#[cfg(not(feature = "interpose"))]
mod slot {
    use core::cell::Cell;

    std::thread_local! {
        static UNSAFE_STACK_PTR: Cell<*mut u8> = const { Cell::new(core::ptr::null_mut()) };
    }

    #[inline(always)]
    pub fn get() -> *mut u8 {
        UNSAFE_STACK_PTR.with(Cell::get)
    }

    #[inline(always)]
    pub fn set(pointer: *mut u8) {
        UNSAFE_STACK_PTR.with(|slot| slot.set(pointer))
    }
}

#[derive(Clone, Copy)]
struct StackState {
    region: Option<UnsafeStackRegion>,
    owner: Option<&'static Runtime>,
}

impl StackState {
    const EMPTY: StackState = StackState {
        region: None,
        owner: None,
    };
}

std::thread_local! {
    static STATE: Cell<StackState> = const { Cell::new(StackState::EMPTY) };
}

/// Make `region` the calling thread's unsafe stack.
///
/// The slot starts at the top of the region and must be
/// [`STACK_ALIGN`]-aligned; anything else means the size was miscomputed
/// upstream. On error nothing is changed.
pub fn install(region: UnsafeStackRegion, owner: &'static Runtime) -> WardResult<()> {
    let pointer = region.top();
    if pointer as usize & (STACK_ALIGN - 1) != 0 {
        return Err(WardError::MisalignedStackPointer {
            pointer: pointer as usize,
        });
    }

    slot::set(pointer);
    STATE.with(|state| {
        state.set(StackState {
            region: Some(region),
            owner: Some(owner),
        })
    });
    Ok(())
}

/// Detach the calling thread's region, clearing the slot and bookkeeping.
///
/// Returns the region and its owner so the caller can release it.
pub fn take() -> Option<(UnsafeStackRegion, &'static Runtime)> {
    let state = STATE.with(|state| state.replace(StackState::EMPTY));
    slot::set(ptr::null_mut());
    match state {
        StackState {
            region: Some(region),
            owner: Some(owner),
        } => Some((region, owner)),
        _ => None,
    }
}

/// The calling thread's region, if one is installed
pub fn current_region() -> Option<UnsafeStackRegion> {
    STATE.with(|state| state.get().region)
}

/// The runtime that installed the calling thread's region
pub fn current_owner() -> Option<&'static Runtime> {
    STATE.with(|state| state.get().owner)
}

/// Lowest usable address of the calling thread's unsafe stack, or null
pub fn current_base() -> *mut u8 {
    current_region().map_or(ptr::null_mut(), |region| region.base().as_ptr())
}

/// Top of the calling thread's unsafe stack, or null
pub fn current_top() -> *mut u8 {
    current_region().map_or(ptr::null_mut(), |region| region.top())
}

/// Guard size of the calling thread's unsafe stack
pub fn current_guard_size() -> usize {
    current_region().map_or(0, |region| region.guard_size())
}

/// Current value of the stack pointer slot
#[inline(always)]
pub fn current_pointer() -> *mut u8 {
    slot::get()
}
