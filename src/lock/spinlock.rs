//! Spin locks.
use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};

use super::{Guard, Lock, RawLock};

/// Mutual exclusion lock that busy waits (spins).
///
/// Interrupt masking is the platform's concern; this type only provides
/// the acquire/release ordering needed for mutual exclusion.
pub struct RawSpinLock {
    /// Name of lock for debugging.
    name: &'static str,

    locked: AtomicBool,
}

/// Locks that busy wait (spin).
pub type SpinLock<T> = Lock<RawSpinLock, T>;
/// Guards of `SpinLock<T>`.
pub type SpinLockGuard<'s, T> = Guard<'s, RawSpinLock, T>;

impl RawSpinLock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            locked: AtomicBool::new(false),
        }
    }
}

impl RawLock for RawSpinLock {
    /// Acquires the lock, spinning until it is free.
    ///
    /// The exchange uses `Acquire` ordering and pairs with the `Release`
    /// store in `release()`, so stores made inside one critical section
    /// are visible to loads in the next.
    fn acquire(&self) {
        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }
    }

    fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }

    fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }
}

impl<T> SpinLock<T> {
    /// Returns a new `SpinLock` with name `name` and data `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: RawSpinLock::new(name),
            data: UnsafeCell::new(data),
        }
    }

    pub fn name(&self) -> &'static str {
        self.lock.name
    }
}
