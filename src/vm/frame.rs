//! Frame table.
//!
//! A frame is a physical page currently owned by some process's virtual
//! page. Frames live in a global list swept circularly by the clock
//! hand during eviction; the hand survives across allocations. Each
//! frame holds a weak back-pointer to its owning page record: the page
//! side owns the strong reference (through its location variant), so
//! the cycle page -> frame -> page never keeps either alive.
//!
//! Victim selection and the eviction itself live in the `vm` module,
//! which can reach the swap area and the file system; this module owns
//! only the bookkeeping: the pool budget, the list, and the hand.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::lock::SpinLock;
use crate::param::PGSIZE;

use super::page::Page;

bitflags! {
    /// Page-allocation flags.
    pub struct AllocFlags: u32 {
        /// Allocate from the user pool.
        const USER = 1 << 0;
        /// Zero the page before handing it out.
        const ZERO = 1 << 1;
    }
}

struct Owner {
    page: Weak<Page>,

    /// Thread that owns the frame, for debugging and `free` checks.
    tid: usize,

    /// Pinned frames are skipped by the clock hand.
    pinned: bool,
}

/// A physical page bound to one virtual page.
pub struct Frame {
    data: SpinLock<Box<[u8; PGSIZE]>>,
    owner: SpinLock<Owner>,
}

impl Frame {
    fn new(page: &Arc<Page>) -> Self {
        Self {
            data: SpinLock::new("frame data", Box::new([0; PGSIZE])),
            owner: SpinLock::new(
                "frame owner",
                Owner {
                    page: Arc::downgrade(page),
                    tid: page.tid,
                    pinned: false,
                },
            ),
        }
    }

    /// Base address of the physical page, as handed to the MMU.
    pub fn base(&self) -> usize {
        self.data.lock().as_ptr() as usize
    }

    /// Runs `f` over the page contents. The owning page's lock is what
    /// serializes access in practice; this lock only keeps the
    /// reference rules honest.
    pub fn with_data<R>(&self, f: impl FnOnce(&mut [u8; PGSIZE]) -> R) -> R {
        f(&mut *self.data.lock())
    }

    /// Rebinds the frame to a new owning page, optionally zeroing it.
    pub(super) fn rebind(&self, page: &Arc<Page>, zero: bool) {
        {
            let mut owner = self.owner.lock();
            owner.page = Arc::downgrade(page);
            owner.tid = page.tid;
            owner.pinned = false;
        }
        if zero {
            self.data.lock().fill(0);
        }
    }

    pub(super) fn owner_page(&self) -> Weak<Page> {
        Weak::clone(&self.owner.lock().page)
    }

    pub fn is_pinned(&self) -> bool {
        self.owner.lock().pinned
    }

    pub fn set_pinned(&self, pinned: bool) {
        self.owner.lock().pinned = pinned;
    }

    /// Thread owning the frame.
    pub fn owner_tid(&self) -> usize {
        self.owner.lock().tid
    }
}

struct Frames {
    /// Clock order. The hand indexes the next frame to examine.
    list: Vec<Arc<Frame>>,
    hand: usize,
}

pub struct FrameTable {
    inner: SpinLock<Frames>,

    /// User-pool budget in pages.
    capacity: usize,
}

impl FrameTable {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "frame table: empty user pool");
        Self {
            inner: SpinLock::new(
                "frame table",
                Frames {
                    list: Vec::with_capacity(capacity),
                    hand: 0,
                },
            ),
            capacity,
        }
    }

    /// Raw allocation from the user pool: returns a fresh frame bound
    /// to `page`, or `None` when the pool is exhausted and the caller
    /// must evict.
    pub(super) fn grab_fresh(&self, page: &Arc<Page>, flags: AllocFlags) -> Option<Arc<Frame>> {
        debug_assert!(flags.contains(AllocFlags::USER));
        let mut inner = self.inner.lock();
        if inner.list.len() >= self.capacity {
            return None;
        }
        // Fresh pages start zeroed; ZERO is a no-op here.
        let frame = Arc::new(Frame::new(page));
        inner.list.push(Arc::clone(&frame));
        Some(frame)
    }

    /// Returns the frame under the clock hand and advances the hand.
    pub(super) fn clock_next(&self) -> Arc<Frame> {
        let mut inner = self.inner.lock();
        assert!(!inner.list.is_empty(), "frame table: clock on empty list");
        let idx = inner.hand % inner.list.len();
        inner.hand = (idx + 1) % inner.list.len();
        Arc::clone(&inner.list[idx])
    }

    /// Unlinks `frame` from the table, returning its page to the pool.
    pub fn free(&self, frame: &Arc<Frame>) {
        let mut inner = self.inner.lock();
        let idx = match inner.list.iter().position(|f| Arc::ptr_eq(f, frame)) {
            Some(idx) => idx,
            None => return,
        };
        let _ = inner.list.remove(idx);
        // Keep the hand on the element that slid into the hole.
        if idx < inner.hand {
            inner.hand -= 1;
        }
        if inner.list.is_empty() {
            inner.hand = 0;
        } else {
            inner.hand %= inner.list.len();
        }
    }

    /// Number of frames currently allocated.
    pub fn len(&self) -> usize {
        self.inner.lock().list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
