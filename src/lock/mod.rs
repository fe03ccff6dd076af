//! The lock module.
//! Contains types that provide mutual exclusion.
//!
//! Two flavors share one skeleton: a [`Lock`] owns a [`RawLock`] and the
//! protected data, and hands out a [`Guard`] whose lifetime bounds the
//! critical section.
//!
//! * [`SpinLock`] busy-waits and is meant for short sections that never
//!   block: table lookups, counter updates, list surgery.
//! * [`SleepLock`] is a long-term lock built over a [`Semaphore`]; it may
//!   be held across disk I/O. Whether a waiter truly sleeps or merely
//!   yields is the platform scheduler's business, not this module's.
//!
//! [`Semaphore`] itself is exported for rendezvous-style signalling.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

mod semaphore;
mod sleeplock;
mod spinlock;

pub use semaphore::Semaphore;
pub use sleeplock::{RawSleepLock, SleepLock, SleepLockGuard};
pub use spinlock::{RawSpinLock, SpinLock, SpinLockGuard};

pub trait RawLock {
    /// Acquires the lock.
    fn acquire(&self);
    /// Releases the lock.
    fn release(&self);
    /// Acquires the lock only if it is immediately available.
    fn try_acquire(&self) -> bool;
}

/// Locks that provide mutual exclusion and own their own `RawLock`.
pub struct Lock<R: RawLock, T> {
    lock: R,
    data: UnsafeCell<T>,
}

unsafe impl<R: RawLock + Send, T: Send> Send for Lock<R, T> {}
unsafe impl<R: RawLock + Sync, T: Send> Sync for Lock<R, T> {}

/// Guards that guarantee exclusive mutable access to the lock's inner data.
pub struct Guard<'s, R: RawLock, T> {
    lock: &'s Lock<R, T>,
    _marker: PhantomData<*const ()>,
}

// Do not implement Send; a lock must be released where it was acquired.
unsafe impl<'s, R: RawLock + Sync, T: Sync> Sync for Guard<'s, R, T> {}

impl<R: RawLock, T> Lock<R, T> {
    /// Acquires the lock and returns the lock guard.
    pub fn lock(&self) -> Guard<'_, R, T> {
        self.lock.acquire();
        Guard {
            lock: self,
            _marker: PhantomData,
        }
    }

    /// Returns the guard only if the lock is immediately available.
    pub fn try_lock(&self) -> Option<Guard<'_, R, T>> {
        if self.lock.try_acquire() {
            Some(Guard {
                lock: self,
                _marker: PhantomData,
            })
        } else {
            None
        }
    }

    /// Returns a mutable reference to the inner data without locking.
    /// `&mut self` proves there is no other reference to the lock.
    pub fn get_mut(&mut self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

impl<R: RawLock, T> Guard<'_, R, T> {
    /// Temporarily releases the lock while running `f`.
    ///
    /// The data must not be assumed unchanged across this call.
    pub fn reacquire_after<U>(&mut self, f: impl FnOnce() -> U) -> U {
        self.lock.lock.release();
        let r = f();
        self.lock.lock.acquire();
        r
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
        unsafe { &*self.lock.data.get() }
    }
}

impl<R: RawLock, T> DerefMut for Guard<'_, R, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.data.get() }
    }
}
