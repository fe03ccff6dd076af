//! Long-term locks for processes.
use core::cell::UnsafeCell;

use super::{Guard, Lock, RawLock, Semaphore};

/// Long-term lock backed by a binary [`Semaphore`].
///
/// May be held across disk I/O and other suspension points, which a
/// [`super::SpinLock`] must never be.
pub struct RawSleepLock {
    locked: Semaphore,
}

/// Locks that may suspend the holder instead of busy waiting.
pub type SleepLock<T> = Lock<RawSleepLock, T>;
pub type SleepLockGuard<'s, T> = Guard<'s, RawSleepLock, T>;

impl RawSleepLock {
    const fn new(name: &'static str) -> Self {
        Self {
            locked: Semaphore::new(name, 1),
        }
    }
}

impl RawLock for RawSleepLock {
    fn acquire(&self) {
        self.locked.down();
    }

    fn release(&self) {
        self.locked.up();
    }

    fn try_acquire(&self) -> bool {
        self.locked.try_down()
    }
}

impl<T> SleepLock<T> {
    /// Returns a new `SleepLock` with name `name` and data `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: RawSleepLock::new(name),
            data: UnsafeCell::new(data),
        }
    }
}
