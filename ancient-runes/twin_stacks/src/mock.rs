//! Test doubles for the memory and threading seams
//!
//! `RecordingMapper` maps real memory through [`SystemMapper`] and logs
//! every call. `MockHost` runs spawned threads on scoped std threads and
//! plays the C library's part at thread exit: up to
//! [`DESTRUCTOR_ITERATIONS`] rounds of key destructors, each round calling
//! the destructor of every key that still holds a non-null value.
//!
//! Both write to one shared [`Journal`], so tests can check the order of
//! mapping calls against destructor passes.

use core::cell::Cell;
use core::ffi::c_void;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use libc::{c_int, pthread_attr_t, pthread_t};
use spin::Mutex;
use crate::config::DESTRUCTOR_ITERATIONS;
use crate::error::{WardError, WardResult};
use crate::host::{CleanupKey, KeyDestructor, StackAttributes, StartRoutine, ThreadHost};
use crate::mapper::{PageMapper, Protection, SystemMapper};
use crate::runtime::Runtime;
use crate::thread_state;

/// Something observable that happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Map { addr: usize, len: usize },
    Protect { addr: usize, len: usize, protection: Protection },
    Unmap { addr: usize, len: usize },
    /// The cleanup key was set to `value`
    KeySet { value: usize },
    /// A destructor pass ran for the cleanup key holding `value`
    Pass { value: usize },
    /// A third-party destructor ran; was the unsafe stack still there?
    Foreign { region_live: bool },
}

/// Shared, ordered event log
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<Event>>>);

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: Event) {
        self.0.lock().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().clone()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

/// Real mapper that journals every successful call
pub struct RecordingMapper {
    inner: SystemMapper,
    journal: Journal,
}

impl RecordingMapper {
    pub fn new() -> Self {
        Self::with_journal(Journal::new())
    }

    pub fn with_journal(journal: Journal) -> Self {
        Self {
            inner: SystemMapper::new(),
            journal,
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.journal.events()
    }

    /// Every unmap as `(addr, len)`
    pub fn unmaps(&self) -> Vec<(usize, usize)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Unmap { addr, len } => Some((addr, len)),
                _ => None,
            })
            .collect()
    }
}

impl PageMapper for RecordingMapper {
    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    fn map(&self, len: usize, protection: Protection) -> WardResult<NonNull<u8>> {
        let addr = self.inner.map(len, protection)?;
        self.journal.push(Event::Map {
            addr: addr.as_ptr() as usize,
            len,
        });
        Ok(addr)
    }

    unsafe fn protect(&self, addr: NonNull<u8>, len: usize, protection: Protection) -> WardResult<()> {
        self.inner.protect(addr, len, protection)?;
        self.journal.push(Event::Protect {
            addr: addr.as_ptr() as usize,
            len,
            protection,
        });
        Ok(())
    }

    unsafe fn unmap(&self, addr: NonNull<u8>, len: usize) -> WardResult<()> {
        self.inner.unmap(addr, len)?;
        self.journal.push(Event::Unmap {
            addr: addr.as_ptr() as usize,
            len,
        });
        Ok(())
    }
}

std::thread_local! {
    /// This thread's value for the cleanup key
    static KEY_VALUE: Cell<usize> = const { Cell::new(0) };
    /// This thread's value for the simulated third-party key
    static FOREIGN_VALUE: Cell<usize> = const { Cell::new(0) };
}

/// Scripted threading host
pub struct MockHost {
    journal: Journal,
    pub stack_limit: Option<usize>,
    pub defaults: StackAttributes,
    pub requested: StackAttributes,
    /// Status returned by `spawn`; non-zero spawns nothing
    pub spawn_code: c_int,
    /// Times a third-party destructor re-arms itself; `None` disables it
    pub foreign_rearms: Option<usize>,
    /// Number of upcoming `create_cleanup_key` calls that fail with `EAGAIN`
    pub key_failures: AtomicUsize,
    destructor: Mutex<Option<KeyDestructor>>,
    next_thread: AtomicUsize,
}

impl MockHost {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            stack_limit: Some(8 << 20),
            defaults: StackAttributes {
                size: 256 * 1024,
                guard_size: 8192,
            },
            requested: StackAttributes {
                size: 1 << 20,
                guard_size: 4096,
            },
            spawn_code: 0,
            foreign_rearms: None,
            key_failures: AtomicUsize::new(0),
            destructor: Mutex::new(None),
            next_thread: AtomicUsize::new(1),
        }
    }

    /// Thread exit as the C library performs it
    pub fn run_exit_passes(&self) {
        if let Some(rearms) = self.foreign_rearms {
            FOREIGN_VALUE.with(|value| value.set(rearms + 1));
        }
        let destructor = *self.destructor.lock();

        for _ in 0..DESTRUCTOR_ITERATIONS {
            let foreign = FOREIGN_VALUE.with(|value| value.replace(0));
            let ours = KEY_VALUE.with(|value| value.replace(0));
            if foreign == 0 && ours == 0 {
                break;
            }

            // Keys run in creation order; the cleanup key is created first
            if ours != 0 {
                self.journal.push(Event::Pass { value: ours });
                if let Some(destructor) = destructor {
                    unsafe { destructor(ours as *mut c_void) };
                }
            }
            if foreign != 0 {
                self.journal.push(Event::Foreign {
                    region_live: thread_state::current_region().is_some(),
                });
                if foreign > 1 {
                    FOREIGN_VALUE.with(|value| value.set(foreign - 1));
                }
            }
        }
    }
}

impl ThreadHost for MockHost {
    fn stack_size_limit(&self) -> Option<usize> {
        self.stack_limit
    }

    fn default_attributes(&self) -> WardResult<StackAttributes> {
        Ok(self.defaults)
    }

    unsafe fn requested_attributes(&self, _attr: *const pthread_attr_t) -> WardResult<StackAttributes> {
        Ok(self.requested)
    }

    fn install_interception(&self) -> WardResult<()> {
        Ok(())
    }

    fn create_cleanup_key(&self, destructor: KeyDestructor) -> WardResult<CleanupKey> {
        let failing = self
            .key_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(WardError::KeyCreateFailed { code: libc::EAGAIN });
        }
        *self.destructor.lock() = Some(destructor);
        Ok(CleanupKey(7))
    }

    fn set_cleanup_value(&self, _key: CleanupKey, value: *mut c_void) -> WardResult<()> {
        KEY_VALUE.with(|slot| slot.set(value as usize));
        self.journal.push(Event::KeySet {
            value: value as usize,
        });
        Ok(())
    }

    unsafe fn spawn(
        &self,
        thread: *mut pthread_t,
        _attr: *const pthread_attr_t,
        start: StartRoutine,
        arg: *mut c_void,
    ) -> c_int {
        if self.spawn_code != 0 {
            return self.spawn_code;
        }

        *thread = self.next_thread.fetch_add(1, Ordering::Relaxed) as pthread_t;
        let arg = arg as usize;
        std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    start(arg as *mut c_void);
                    self.run_exit_passes();
                })
                .join()
                .expect("mock thread panicked");
        });
        0
    }
}

/// Leak a runtime over the given seams for the rest of the test process
pub fn leak_runtime(mapper: RecordingMapper, host: MockHost) -> (&'static Runtime, &'static MockHost) {
    let mapper: &'static RecordingMapper = Box::leak(Box::new(mapper));
    let host: &'static MockHost = Box::leak(Box::new(host));
    let runtime: &'static Runtime = Box::leak(Box::new(Runtime::new(mapper, host)));
    (runtime, host)
}
