//! Counting semaphores.
use core::hint::spin_loop;
use core::sync::atomic::{AtomicUsize, Ordering};

/// A counting semaphore.
///
/// `down` waits for the value to become positive and decrements it;
/// `up` increments it and releases one waiter. Used both as the base of
/// [`super::SleepLock`] and directly for rendezvous between threads
/// (e.g. a parent waiting for a child to report load success).
///
/// Waiters spin-wait; on a real machine the scheduler's wait queue
/// stands in for the spin.
pub struct Semaphore {
    /// Name of the semaphore for debugging.
    name: &'static str,

    value: AtomicUsize,
}

impl Semaphore {
    pub const fn new(name: &'static str, value: usize) -> Self {
        Self {
            name,
            value: AtomicUsize::new(value),
        }
    }

    /// Waits for the value to become positive, then decrements it.
    pub fn down(&self) {
        loop {
            if self.try_down() {
                return;
            }
            spin_loop();
        }
    }

    /// Decrements the value if it is positive, without waiting.
    pub fn try_down(&self) -> bool {
        self.value
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |v| v.checked_sub(1))
            .is_ok()
    }

    /// Increments the value, releasing one waiter.
    pub fn up(&self) {
        let _ = self.value.fetch_add(1, Ordering::Release);
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}
