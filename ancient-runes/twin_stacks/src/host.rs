//! # The Threading Host
//!
//! Everything the runtime needs from the C library's thread implementation,
//! behind one trait: the stack resource limit, thread attributes, a
//! re-armable thread-specific key with a destructor, and the real spawn
//! primitive that the interceptor forwards to.

use core::ffi::c_void;
use libc::{c_int, pthread_attr_t, pthread_key_t, pthread_t};
use spin::Once;
use crate::error::{WardError, WardResult};

/// Thread entry point as the C library sees it
pub type StartRoutine = extern "C" fn(*mut c_void) -> *mut c_void;

/// Thread-specific key destructor
pub type KeyDestructor = unsafe extern "C" fn(*mut c_void);

/// Signature of the real `pthread_create`
pub type SpawnFn =
    unsafe extern "C" fn(*mut pthread_t, *const pthread_attr_t, StartRoutine, *mut c_void) -> c_int;

/// Stack geometry requested for a new thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackAttributes {
    pub size: usize,
    pub guard_size: usize,
}

/// Handle to the process-wide cleanup key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupKey(pub pthread_key_t);

/// Host threading implementation
pub trait ThreadHost: Sync {
    /// Current stack size limit, `None` when unlimited or unknown
    fn stack_size_limit(&self) -> Option<usize>;

    /// Stack geometry of a default-initialised attribute object
    fn default_attributes(&self) -> WardResult<StackAttributes>;

    /// Stack geometry requested by `attr`
    ///
    /// # Safety
    /// `attr` must point to an initialised attribute object.
    unsafe fn requested_attributes(&self, attr: *const pthread_attr_t) -> WardResult<StackAttributes>;

    /// Resolve the real spawn primitive
    fn install_interception(&self) -> WardResult<()>;

    /// Create a key whose destructor runs at thread exit
    fn create_cleanup_key(&self, destructor: KeyDestructor) -> WardResult<CleanupKey>;

    /// Set the calling thread's value for `key`
    fn set_cleanup_value(&self, key: CleanupKey, value: *mut c_void) -> WardResult<()>;

    /// Call the real spawn primitive, returning its status untouched
    ///
    /// # Safety
    /// Same contract as `pthread_create`.
    unsafe fn spawn(
        &self,
        thread: *mut pthread_t,
        attr: *const pthread_attr_t,
        start: StartRoutine,
        arg: *mut c_void,
    ) -> c_int;
}

/// The C library's pthread implementation
pub struct PthreadHost {
    real_spawn: Once<SpawnFn>,
}

impl PthreadHost {
    pub const fn new() -> Self {
        Self {
            real_spawn: Once::new(),
        }
    }
}

impl Default for PthreadHost {
    fn default() -> Self {
        Self::new()
    }
}

/// With the C ABI exported, our own `pthread_create` shadows the C
/// library's, so the real one is looked up past us.
#[cfg(feature = "interpose")]
fn resolve_real_spawn() -> WardResult<SpawnFn> {
    let sym = unsafe { libc::dlsym(libc::RTLD_NEXT, b"pthread_create\0".as_ptr().cast()) };
    if sym.is_null() {
        return Err(WardError::InterceptionFailed);
    }
    // SAFETY: the symbol is the C library's pthread_create
    Ok(unsafe { core::mem::transmute::<*mut c_void, SpawnFn>(sym) })
}

#[cfg(not(feature = "interpose"))]
fn resolve_real_spawn() -> WardResult<SpawnFn> {
    Ok(libc::pthread_create as SpawnFn)
}

unsafe fn read_attributes(attr: *const pthread_attr_t) -> WardResult<StackAttributes> {
    let mut size = 0;
    let mut guard_size = 0;

    let code = libc::pthread_attr_getstacksize(attr, &mut size);
    if code != 0 {
        return Err(WardError::AttributeQueryFailed { code });
    }
    let code = libc::pthread_attr_getguardsize(attr, &mut guard_size);
    if code != 0 {
        return Err(WardError::AttributeQueryFailed { code });
    }

    Ok(StackAttributes { size, guard_size })
}

impl ThreadHost for PthreadHost {
    fn stack_size_limit(&self) -> Option<usize> {
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: limit is a valid out-pointer
        if unsafe { libc::getrlimit(libc::RLIMIT_STACK, &mut limit) } != 0 {
            return None;
        }
        if limit.rlim_cur == libc::RLIM_INFINITY {
            return None;
        }
        Some(limit.rlim_cur as usize)
    }

    fn default_attributes(&self) -> WardResult<StackAttributes> {
        let mut attr = core::mem::MaybeUninit::<pthread_attr_t>::uninit();
        unsafe {
            let code = libc::pthread_attr_init(attr.as_mut_ptr());
            if code != 0 {
                return Err(WardError::AttributeQueryFailed { code });
            }
            let attributes = read_attributes(attr.as_ptr());
            libc::pthread_attr_destroy(attr.as_mut_ptr());
            attributes
        }
    }

    unsafe fn requested_attributes(&self, attr: *const pthread_attr_t) -> WardResult<StackAttributes> {
        read_attributes(attr)
    }

    fn install_interception(&self) -> WardResult<()> {
        let real = resolve_real_spawn()?;
        self.real_spawn.call_once(|| real);
        Ok(())
    }

    fn create_cleanup_key(&self, destructor: KeyDestructor) -> WardResult<CleanupKey> {
        let mut key: pthread_key_t = 0;
        let code = unsafe { libc::pthread_key_create(&mut key, Some(destructor)) };
        if code != 0 {
            return Err(WardError::KeyCreateFailed { code });
        }
        Ok(CleanupKey(key))
    }

    fn set_cleanup_value(&self, key: CleanupKey, value: *mut c_void) -> WardResult<()> {
        let code = unsafe { libc::pthread_setspecific(key.0, value) };
        if code != 0 {
            return Err(WardError::KeySetFailed { code });
        }
        Ok(())
    }

    unsafe fn spawn(
        &self,
        thread: *mut pthread_t,
        attr: *const pthread_attr_t,
        start: StartRoutine,
        arg: *mut c_void,
    ) -> c_int {
        let real = match self.real_spawn.get() {
            Some(real) => *real,
            None => crate::chronicle::fatal(format_args!("pthread_create called before interception was installed")),
        };
        real(thread, attr, start, arg)
    }
}
