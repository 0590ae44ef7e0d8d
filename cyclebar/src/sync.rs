//! Process-shared pthread mutex and condition variable.
//!
//! Both objects live inside the shared mapping and are initialized in place
//! by the leader before the mapping is published. On Linux the mutex is
//! robust: when a holder dies, the next locker is told so instead of hanging.

use std::cell::UnsafeCell;
use std::io;
use std::mem::MaybeUninit;
use std::time::Duration;

#[cfg(target_os = "linux")]
const COND_CLOCK: libc::clockid_t = libc::CLOCK_MONOTONIC;
#[cfg(not(target_os = "linux"))]
const COND_CLOCK: libc::clockid_t = libc::CLOCK_REALTIME;

/// Result of acquiring the mutex or of waking up from a condvar wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    /// Normal acquisition or a (possibly spurious) signal.
    Signaled,
    /// The deadline passed; the mutex is held again.
    TimedOut,
    /// The previous holder died while holding the mutex. The mutex is held
    /// and has been marked consistent, but the data it guards may be torn.
    OwnerDied,
}

fn check(r: libc::c_int) -> io::Result<()> {
    if r == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(r))
    }
}

#[repr(C)]
pub(crate) struct ProcessMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

impl ProcessMutex {
    /// # Safety
    /// Must be called exactly once, before any other process can see the
    /// memory this mutex lives in.
    pub unsafe fn init(&self) -> io::Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        check(libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;
        let res = init_mutex(self.inner.get(), attr.as_mut_ptr());
        libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
        res
    }

    pub fn lock(&self) -> io::Result<Wake> {
        let r = unsafe { libc::pthread_mutex_lock(self.inner.get()) };
        self.after_acquire(r)
    }

    pub fn unlock(&self) {
        unsafe {
            libc::pthread_mutex_unlock(self.inner.get());
        }
    }

    fn after_acquire(&self, r: libc::c_int) -> io::Result<Wake> {
        match r {
            0 => Ok(Wake::Signaled),
            libc::ETIMEDOUT => Ok(Wake::TimedOut),
            #[cfg(target_os = "linux")]
            libc::EOWNERDEAD => {
                unsafe { libc::pthread_mutex_consistent(self.inner.get()) };
                Ok(Wake::OwnerDied)
            }
            e => Err(io::Error::from_raw_os_error(e)),
        }
    }

    fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.inner.get()
    }
}

#[repr(C)]
pub(crate) struct ProcessCondvar {
    inner: UnsafeCell<libc::pthread_cond_t>,
}

impl ProcessCondvar {
    /// # Safety
    /// Same contract as [`ProcessMutex::init`].
    pub unsafe fn init(&self) -> io::Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
        check(libc::pthread_condattr_init(attr.as_mut_ptr()))?;
        let res = init_cond(self.inner.get(), attr.as_mut_ptr());
        libc::pthread_condattr_destroy(attr.as_mut_ptr());
        res
    }

    /// Waits on `mutex`, which the caller must hold. Returns with it held.
    pub fn wait(&self, mutex: &ProcessMutex, deadline: Option<&Deadline>) -> io::Result<Wake> {
        let r = unsafe {
            match deadline {
                Some(d) => libc::pthread_cond_timedwait(self.inner.get(), mutex.raw(), &d.0),
                None => libc::pthread_cond_wait(self.inner.get(), mutex.raw()),
            }
        };
        mutex.after_acquire(r)
    }

    pub fn broadcast(&self) {
        unsafe {
            libc::pthread_cond_broadcast(self.inner.get());
        }
    }
}

unsafe fn init_mutex(
    mutex: *mut libc::pthread_mutex_t,
    attr: *mut libc::pthread_mutexattr_t,
) -> io::Result<()> {
    check(libc::pthread_mutexattr_setpshared(
        attr,
        libc::PTHREAD_PROCESS_SHARED,
    ))?;
    #[cfg(target_os = "linux")]
    check(libc::pthread_mutexattr_setrobust(
        attr,
        libc::PTHREAD_MUTEX_ROBUST,
    ))?;
    check(libc::pthread_mutex_init(mutex, attr))
}

unsafe fn init_cond(
    cond: *mut libc::pthread_cond_t,
    attr: *mut libc::pthread_condattr_t,
) -> io::Result<()> {
    check(libc::pthread_condattr_setpshared(
        attr,
        libc::PTHREAD_PROCESS_SHARED,
    ))?;
    #[cfg(target_os = "linux")]
    check(libc::pthread_condattr_setclock(attr, COND_CLOCK))?;
    check(libc::pthread_cond_init(cond, attr))
}

/// Absolute wake-up time on the clock the condvar was configured with.
#[derive(Clone, Copy)]
pub(crate) struct Deadline(libc::timespec);

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        let mut now = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe { libc::clock_gettime(COND_CLOCK, &mut now) };
        let total_nsec = now.tv_nsec as u64 + timeout.subsec_nanos() as u64;
        let secs = (now.tv_sec as u64)
            .saturating_add(timeout.as_secs())
            .saturating_add(total_nsec / 1_000_000_000);
        Deadline(libc::timespec {
            tv_sec: secs.min(libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: (total_nsec % 1_000_000_000) as _,
        })
    }
}
