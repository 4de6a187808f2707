//! Process-shared mutex guarding the segment.
//!
//! The mutex lives inside the shared mapping so forked workers contend on the
//! same lock. [`LockGuard`] scopes one cache operation. When the caller holds
//! the batch lock the guard is inert and operations nest inside the batch.

use std::cell::Cell;

use tracing::error;

use crate::error::{CacheError, CacheResult};

/// Thin wrapper around a `pthread_mutex_t` placed in shared memory.
#[derive(Clone, Copy)]
pub(crate) struct ProcessMutex {
    raw: *mut libc::pthread_mutex_t,
}

impl ProcessMutex {
    /// Initialize the mutex at `raw` as `PTHREAD_PROCESS_SHARED`.
    ///
    /// # Safety
    /// `raw` must point to writable, suitably aligned memory that outlives the
    /// returned handle and is not yet an initialized mutex.
    pub(crate) unsafe fn init(raw: *mut libc::pthread_mutex_t) -> CacheResult<Self> {
        unsafe {
            let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
            check(libc::pthread_mutexattr_init(&mut attr))?;
            let rc = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
            if rc != 0 {
                libc::pthread_mutexattr_destroy(&mut attr);
                return Err(CacheError::Lock(rc));
            }
            let rc = libc::pthread_mutex_init(raw, &attr);
            libc::pthread_mutexattr_destroy(&mut attr);
            check(rc)?;
        }
        Ok(Self { raw })
    }

    /// Handle to an already initialized mutex.
    ///
    /// # Safety
    /// `raw` must point to a mutex initialized by [`ProcessMutex::init`].
    pub(crate) unsafe fn from_raw(raw: *mut libc::pthread_mutex_t) -> Self {
        Self { raw }
    }

    pub(crate) fn lock(&self) -> CacheResult<()> {
        // Safety: the pointer is valid for the lifetime of the segment.
        check(unsafe { libc::pthread_mutex_lock(self.raw) })
    }

    pub(crate) fn unlock(&self) -> CacheResult<()> {
        // Safety: as above.
        check(unsafe { libc::pthread_mutex_unlock(self.raw) })
    }

    /// Destroy the mutex.
    ///
    /// # Safety
    /// No process may use the mutex afterwards.
    pub(crate) unsafe fn destroy(self) {
        let rc = unsafe { libc::pthread_mutex_destroy(self.raw) };
        if rc != 0 {
            error!("failed to destroy value cache mutex: {}", CacheError::Lock(rc));
        }
    }
}

#[inline]
fn check(rc: libc::c_int) -> CacheResult<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(CacheError::Lock(rc))
    }
}

/// Holds the segment mutex for the duration of one operation.
pub(crate) struct LockGuard {
    mutex: ProcessMutex,
    /// `false` for guards created under the batch lock.
    owned: bool,
    held: Cell<bool>,
}

impl LockGuard {
    /// Acquire the mutex unless `batch` says the caller already holds it.
    pub(crate) fn acquire(mutex: ProcessMutex, batch: bool) -> CacheResult<Self> {
        if !batch {
            mutex.lock()?;
        }
        Ok(Self {
            mutex,
            owned: !batch,
            held: Cell::new(!batch),
        })
    }

    /// Run `f` with the mutex released, then take it back.
    ///
    /// Under the batch lock the mutex stays held and `f` runs as is.
    pub(crate) fn unlocked<T>(&self, f: impl FnOnce() -> T) -> CacheResult<T> {
        if !self.owned {
            return Ok(f());
        }
        self.mutex.unlock()?;
        self.held.set(false);
        let out = f();
        self.mutex.lock()?;
        self.held.set(true);
        Ok(out)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.held.get() {
            if let Err(e) = self.mutex.unlock() {
                error!("failed to unlock value cache: {e}");
            }
        }
    }
}
