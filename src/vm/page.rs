//! Supplemental page table.
//!
//! Per-process metadata for every virtual page the process may touch.
//! A page record names its permanent backing (anonymous, a segment of
//! the executable, or a window of an mmapped file) and its current
//! location. The location is a tagged variant whose payload *is* the
//! active backing resource — a frame, a swap slot, or nothing beyond
//! the file named by the backing — so exactly one of them exists at any
//! time by construction.
//!
//! All location transitions happen under the per-page lock.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::file::File;
use crate::hal::Mmu;
use crate::lock::{SleepLock, SpinLock};
use crate::param::{pg_round_down, PGSIZE};

use super::frame::Frame;
use super::swap::SwapSlot;

/// Where a page's permanent contents come from.
pub enum Backing {
    /// Stack or other zero-initialized memory; swapped when evicted.
    Anon,

    /// A piece of the executable image: `read_bytes` bytes at `offset`,
    /// zero-filled to a page.
    Executable {
        file: Arc<File>,
        offset: u32,
        read_bytes: u32,
    },

    /// A page-sized window of a memory-mapped file.
    Mmap { file: Arc<File>, offset: u32 },
}

/// Where the page's bytes are right now.
pub enum PageLoc {
    /// Never materialized, or discarded back to its file.
    NotPresent,

    /// Resident; the payload owns the frame.
    Memory(Arc<Frame>),

    /// Paged out; the payload owns the slot.
    Swap(SwapSlot),

    /// Re-readable from the backing file.
    InFile,
}

/// Location discriminant, for checks and tests.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LocKind {
    NotPresent,
    Memory,
    Swap,
    InFile,
}

impl PageLoc {
    pub fn kind(&self) -> LocKind {
        match self {
            PageLoc::NotPresent => LocKind::NotPresent,
            PageLoc::Memory(_) => LocKind::Memory,
            PageLoc::Swap(_) => LocKind::Swap,
            PageLoc::InFile => LocKind::InFile,
        }
    }
}

/// One virtual page's record.
pub struct Page {
    /// Owning thread.
    pub tid: usize,

    /// Page-aligned user virtual base address.
    pub va: usize,

    pub writable: bool,

    pub backing: Backing,

    /// The owning process's page-table hardware.
    pub(crate) mmu: Arc<dyn Mmu>,

    /// Serializes location transitions, including eviction vs. fault.
    pub(crate) state: SleepLock<PageLoc>,
}

impl Page {
    pub fn new(tid: usize, va: usize, writable: bool, backing: Backing, mmu: Arc<dyn Mmu>) -> Self {
        assert_eq!(va % PGSIZE, 0, "page: unaligned base");
        let initial = match backing {
            Backing::Anon => PageLoc::NotPresent,
            Backing::Executable { .. } | Backing::Mmap { .. } => PageLoc::InFile,
        };
        Self {
            tid,
            va,
            writable,
            backing,
            mmu,
            state: SleepLock::new("page", initial),
        }
    }

    /// Location discriminant, taking and releasing the page lock.
    pub fn loc_kind(&self) -> LocKind {
        self.state.lock().kind()
    }
}

/// The supplemental page table: virtual page base -> record.
pub struct Spt {
    pages: SpinLock<BTreeMap<usize, Arc<Page>>>,
}

impl Spt {
    pub fn new() -> Self {
        Self {
            pages: SpinLock::new("spt", BTreeMap::new()),
        }
    }

    /// Inserts a record. Fails if the page is already tracked.
    pub fn insert(&self, page: Arc<Page>) -> Result<(), ()> {
        let mut pages = self.pages.lock();
        if pages.contains_key(&page.va) {
            return Err(());
        }
        let _ = pages.insert(page.va, page);
        Ok(())
    }

    /// Record covering `va`, if any.
    pub fn find(&self, va: usize) -> Option<Arc<Page>> {
        self.pages.lock().get(&pg_round_down(va)).cloned()
    }

    /// Removes and returns the record at page base `va`.
    pub fn remove(&self, va: usize) -> Option<Arc<Page>> {
        self.pages.lock().remove(&va)
    }

    /// Whether any record overlaps `[start, start + len)`.
    pub fn overlaps(&self, start: usize, len: usize) -> bool {
        let pages = self.pages.lock();
        pages
            .range(pg_round_down(start)..start.saturating_add(len))
            .next()
            .is_some()
    }

    /// Drains every record, for process exit.
    pub fn take_all(&self) -> Vec<Arc<Page>> {
        let mut pages = self.pages.lock();
        let drained = core::mem::take(&mut *pages);
        drained.into_iter().map(|(_, p)| p).collect()
    }

    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Spt {
    fn default() -> Self {
        Self::new()
    }
}
