//! The lock module.
//!
//! Contains types that provide mutual exclusion.
//!
//! Locks in this module really spin: the waiter busy-waits with interrupts
//! disabled on its hart, exactly like the hardware discipline they model.
//! Acquiring any lock disables interrupts on the current hart first (nested,
//! see `Cpus::push_off`), which prevents a recursive deadlock where a timer
//! interrupt on the same hart tries to acquire a lock the interrupted code
//! already holds.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

mod sleepablelock;
mod spinlock;

pub use sleepablelock::{RawSleepablelock, Sleepablelock, SleepablelockGuard};
pub use spinlock::{RawSpinlock, Spinlock, SpinlockGuard};

pub trait RawLock {
    /// Acquires the lock.
    fn acquire(&self);
    /// Releases the lock.
    fn release(&self);
    /// Check whether this hart is holding the lock.
    fn holding(&self) -> bool;
}

/// Locks that provide mutual exclusion and have their own `RawLock`.
pub struct Lock<R: RawLock, T> {
    lock: R,
    data: UnsafeCell<T>,
}

unsafe impl<R: RawLock, T: Send> Sync for Lock<R, T> {}

/// Guards that guarantee exclusive mutable access to the lock's inner data.
pub struct Guard<'s, R: RawLock, T> {
    lock: &'s Lock<R, T>,
    _marker: PhantomData<*const ()>,
}

// Do not implement Send; a lock must be released on the hart that acquired it.
unsafe impl<'s, R: RawLock, T: Sync> Sync for Guard<'s, R, T> {}

impl<R: RawLock, T> Lock<R, T> {
    pub(crate) const fn from_raw(lock: R, data: T) -> Self {
        Self {
            lock,
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the lock and returns the lock guard.
    pub fn lock(&self) -> Guard<'_, R, T> {
        self.lock.acquire();

        Guard {
            lock: self,
            _marker: PhantomData,
        }
    }

    /// Returns a raw pointer to the inner data.
    /// The caller must ensure that accessing the pointer does not incur race.
    pub fn get_mut_raw(&self) -> *mut T {
        self.data.get()
    }

    /// Returns a mutable reference to the inner data.
    pub fn get_mut(&mut self) -> &mut T {
        // SAFETY: we have a mutable reference to the lock.
        unsafe { &mut *self.data.get() }
    }

    /// Check whether this hart is holding the lock.
    pub fn holding(&self) -> bool {
        self.lock.holding()
    }

    /// Unlock the lock.
    ///
    /// # Safety
    ///
    /// Use this only when we acquired the lock but did `mem::forget()` to the guard.
    pub unsafe fn unlock(&self) {
        self.lock.release();
    }
}

impl<'s, R: RawLock, T> Guard<'s, R, T> {
    /// Temporarily releases the lock, calls `f`, and reacquires the lock.
    /// Returns the result of the function call.
    pub fn reacquire_after<F, U>(&mut self, f: F) -> U
    where
        F: FnOnce() -> U,
    {
        self.lock.lock.release();
        let result = f();
        self.lock.lock.acquire();
        result
    }

    pub(crate) fn raw_lock(&self) -> &'s R {
        &self.lock.lock
    }
}

impl<R: RawLock, T> Drop for Guard<'_, R, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}

impl<R: RawLock, T> Deref for Guard<'_, R, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: the lock is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<R: RawLock, T> DerefMut for Guard<'_, R, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: the lock is held and `&mut self` is exclusive.
        unsafe { &mut *self.lock.data.get() }
    }
}
