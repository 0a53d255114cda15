//! # Cleanup Ordering
//!
//! Other thread-specific destructors may still run code whose frames live
//! on the unsafe stack, so the region has to outlive all of them. There is
//! no hook for "every destructor is done"; instead the runtime's own key
//! destructor keeps re-arming itself. The C library calls a destructor
//! again only while its value is non-null and gives up after
//! [`DESTRUCTOR_ITERATIONS`] passes, so re-arming until the last pass and
//! releasing on it puts the release as late as the library allows.
//!
//! The value stored in the key is the pass counter itself:
//!
//! ```text
//!   start:      value = 1
//!   pass n < K: value = n + 1   (re-armed)
//!   pass K:     release region, leave the key null
//! ```
//!
//! Known limitation: a third-party destructor that re-arms itself through
//! all K passes can still run after the release. That risk is accepted.

use core::ffi::c_void;
use crate::config::DESTRUCTOR_ITERATIONS;
use crate::error::OrDie;
use crate::region;
use crate::thread_state;

/// What a destructor pass must do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupStep {
    /// Store `next` in the key so another pass happens
    Rearm { next: usize },
    /// Last pass: release the region
    Release,
}

/// Decide what the pass holding `pass` does when the library guarantees
/// `ceiling` passes.
pub const fn next_step(pass: usize, ceiling: usize) -> CleanupStep {
    if pass < ceiling {
        CleanupStep::Rearm { next: pass + 1 }
    } else {
        CleanupStep::Release
    }
}

/// Key destructor registered by the initializer
pub unsafe extern "C" fn thread_cleanup_handler(value: *mut c_void) {
    run_pass(value as usize, DESTRUCTOR_ITERATIONS);
}

/// One destructor pass for the calling thread
pub fn run_pass(pass: usize, ceiling: usize) {
    let owner = match thread_state::current_owner() {
        Some(owner) => owner,
        None => return,
    };

    match next_step(pass, ceiling) {
        CleanupStep::Rearm { next } => {
            owner
                .host()
                .set_cleanup_value(owner.cleanup_key(), next as *mut c_void)
                .or_die("re-arming unsafe stack cleanup");
        }
        CleanupStep::Release => release_current(),
    }
}

/// Unmap the calling thread's region and forget it
pub fn release_current() {
    if let Some((region, owner)) = thread_state::take() {
        // SAFETY: the region was installed on this thread and the state
        // holding it has just been cleared.
        unsafe { region::release(owner.mapper(), region) }.or_die("releasing unsafe stack");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rearms_below_ceiling() {
        assert_eq!(next_step(1, 4), CleanupStep::Rearm { next: 2 });
        assert_eq!(next_step(2, 4), CleanupStep::Rearm { next: 3 });
        assert_eq!(next_step(3, 4), CleanupStep::Rearm { next: 4 });
    }

    #[test]
    fn test_releases_on_ceiling() {
        assert_eq!(next_step(4, 4), CleanupStep::Release);
    }

    #[test]
    fn test_release_happens_once_over_full_schedule() {
        let mut value = crate::config::CLEANUP_ARMED;
        let mut releases = 0;
        let mut passes = 0;

        // Same contract as the C library: call while non-null, at most K times
        while value != 0 && passes < DESTRUCTOR_ITERATIONS {
            passes += 1;
            let current = core::mem::replace(&mut value, 0);
            match next_step(current, DESTRUCTOR_ITERATIONS) {
                CleanupStep::Rearm { next } => value = next,
                CleanupStep::Release => releases += 1,
            }
        }

        assert_eq!(passes, DESTRUCTOR_ITERATIONS);
        assert_eq!(releases, 1);
        assert_eq!(value, 0);
    }

    #[test]
    fn test_pass_without_region_is_a_no_op() {
        std::thread::spawn(|| run_pass(DESTRUCTOR_ITERATIONS, DESTRUCTOR_ITERATIONS))
            .join()
            .unwrap();
    }
}
