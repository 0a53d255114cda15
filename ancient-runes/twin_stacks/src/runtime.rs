//! # The Runtime
//!
//! Ties the memory and threading seams together and owns the two pieces of
//! process-wide state: the cleanup key and the initialization phase. Both
//! are written once by [`Runtime::init`], before any second thread exists,
//! and only read afterwards.
//!
//! ## Ordering
//! The initializer must run before every other constructor so the main
//! thread has an unsafe stack before any code can use one, and it must
//! finish before the first thread is spawned so every spawn is intercepted
//! and every thread's cleanup can be armed. With the `interpose` feature
//! this is arranged through `.preinit_array`.

use core::sync::atomic::{AtomicU8, Ordering};
use spin::Once;
use crate::chronicle;
use crate::cleanup;
use crate::config::{RuntimeConfig, DEFAULT_UNSAFE_STACK_SIZE};
use crate::error::{OrDie, WardError, WardResult};
use crate::host::{CleanupKey, PthreadHost, ThreadHost};
use crate::mapper::{PageMapper, SystemMapper};
use crate::region::{self, UnsafeStackRegion};
use crate::thread_state;

/// Initialization phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Uninitialized = 0,
    Initializing = 1,
    Ready = 2,
}

impl Phase {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Phase::Uninitialized,
            1 => Phase::Initializing,
            _ => Phase::Ready,
        }
    }
}

/// Unsafe stack lifecycle manager
pub struct Runtime {
    mapper: &'static dyn PageMapper,
    host: &'static dyn ThreadHost,
    cleanup_key: Once<CleanupKey>,
    phase: AtomicU8,
}

static SYSTEM_MAPPER: SystemMapper = SystemMapper::new();
static PTHREAD_HOST: PthreadHost = PthreadHost::new();

/// The process-wide runtime over the kernel and the C library
pub static SYSTEM: Runtime = Runtime::new(&SYSTEM_MAPPER, &PTHREAD_HOST);

impl Runtime {
    pub const fn new(mapper: &'static dyn PageMapper, host: &'static dyn ThreadHost) -> Self {
        Self {
            mapper,
            host,
            cleanup_key: Once::new(),
            phase: AtomicU8::new(Phase::Uninitialized as u8),
        }
    }

    pub fn mapper(&self) -> &'static dyn PageMapper {
        self.mapper
    }

    pub fn host(&self) -> &'static dyn ThreadHost {
        self.host
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == Phase::Ready
    }

    /// The cleanup key; only valid once the runtime is ready
    pub fn cleanup_key(&self) -> CleanupKey {
        match self.cleanup_key.get() {
            Some(key) => *key,
            None => chronicle::fatal(format_args!("{}", WardError::NotReady)),
        }
    }

    /// Set up the main thread's unsafe stack, install interception and
    /// create the cleanup key. Succeeds at most once; a failed attempt
    /// leaves nothing behind and may be repeated.
    ///
    /// Returns the main thread's region.
    pub fn try_init(&'static self) -> WardResult<UnsafeStackRegion> {
        self.phase
            .compare_exchange(
                Phase::Uninitialized as u8,
                Phase::Initializing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| WardError::AlreadyInitialized)?;

        chronicle::set_verbosity(RuntimeConfig::from_environment().verbosity);

        let region = match self.bring_up() {
            Ok(region) => region,
            Err(err) => {
                // Nothing was kept, so a later attempt starts from scratch
                self.phase.store(Phase::Uninitialized as u8, Ordering::Release);
                return Err(err);
            }
        };
        self.phase.store(Phase::Ready as u8, Ordering::Release);

        crate::ward_notice!(
            "main thread unsafe stack {:#x}..{:#x} ({} KiB, guard {} bytes)",
            region.base().as_ptr() as usize,
            region.top() as usize,
            region.usable_size() / 1024,
            region.guard_size()
        );
        Ok(region)
    }

    /// Map and install the main region, then wire up the host. On error the
    /// region is detached and unmapped again.
    fn bring_up(&'static self) -> WardResult<UnsafeStackRegion> {
        let size = self.host.stack_size_limit().unwrap_or(DEFAULT_UNSAFE_STACK_SIZE);
        let guard = self.mapper.page_size();
        let region = region::allocate(self.mapper, size, guard)?;

        if let Err(err) = self.attach_main(region) {
            if thread_state::current_region() == Some(region) {
                thread_state::take();
            }
            // SAFETY: the region is no longer installed anywhere
            if let Err(unmap_err) = unsafe { region::release(self.mapper, region) } {
                crate::ward_trace!("dropping main unsafe stack after failed init: {}", unmap_err);
            }
            return Err(err);
        }
        Ok(region)
    }

    fn attach_main(&'static self, region: UnsafeStackRegion) -> WardResult<()> {
        thread_state::install(region, self)?;
        self.host.install_interception()?;
        let key = self.host.create_cleanup_key(cleanup::thread_cleanup_handler)?;
        self.cleanup_key.call_once(|| key);
        Ok(())
    }

    /// [`Runtime::try_init`], aborting on failure
    pub fn init(&'static self) -> UnsafeStackRegion {
        self.try_init().or_die("initializing unsafe stacks")
    }
}
