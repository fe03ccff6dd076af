//! Memory-mapped files.
//!
//! `mmap` lays the whole contents of an open file over a page-aligned
//! range of user addresses. Pages load lazily on first fault; `munmap`
//! (or process exit) writes resident dirty pages back to the file and
//! discards the range. The mapping holds its own reopened file handle,
//! so closing the original descriptor does not tear the mapping down.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::file::File;
use crate::fs::Tfs;
use crate::lock::SpinLock;
use crate::param::{pg_round_up, PGSIZE, USER_TOP};
use crate::proc::Proc;

use super::page::{Backing, Page, PageLoc};
use super::{write_back_mmap, Vm};

struct Mapping {
    file: Arc<File>,
    pages: Vec<Arc<Page>>,
}

struct Inner {
    maps: BTreeMap<usize, Mapping>,
    next_id: usize,
}

/// A process's live mappings, keyed by mapping id.
pub struct MmapTable {
    inner: SpinLock<Inner>,
}

impl MmapTable {
    pub fn new() -> Self {
        Self {
            inner: SpinLock::new(
                "mmap table",
                Inner {
                    maps: BTreeMap::new(),
                    next_id: 0,
                },
            ),
        }
    }

    fn insert(&self, file: Arc<File>, pages: Vec<Arc<Page>>) -> usize {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        let _ = inner.maps.insert(id, Mapping { file, pages });
        id
    }

    fn remove(&self, id: usize) -> Option<Mapping> {
        self.inner.lock().maps.remove(&id)
    }

    /// Ids of every live mapping, for exit-time teardown.
    pub fn ids(&self) -> Vec<usize> {
        self.inner.lock().maps.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MmapTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    /// Maps the entire contents of `file` at `addr`. The range must be
    /// page-aligned, nonempty, inside user space, and free of existing
    /// page records. Returns the mapping id.
    pub fn mmap(&self, fs: &Tfs, proc: &Proc, file: &Arc<File>, addr: usize) -> Result<usize, ()> {
        if addr == 0 || addr % PGSIZE != 0 {
            return Err(());
        }
        let len = file.len(fs) as usize;
        if len == 0 {
            return Err(());
        }
        let span = pg_round_up(len);
        if addr.checked_add(span).map_or(true, |end| end > USER_TOP) {
            return Err(());
        }
        if proc.spt.overlaps(addr, span) {
            return Err(());
        }

        // The mapping keeps its own handle; the caller's fd may close.
        let handle = file.reopen(fs)?;

        let mut pages: Vec<Arc<Page>> = Vec::with_capacity(span / PGSIZE);
        for i in 0..span / PGSIZE {
            let page = Arc::new(Page::new(
                proc.pid,
                addr + i * PGSIZE,
                true,
                Backing::Mmap {
                    file: Arc::clone(&handle),
                    offset: (i * PGSIZE) as u32,
                },
                Arc::clone(&proc.mmu),
            ));
            if proc.spt.insert(Arc::clone(&page)).is_err() {
                // Raced with another mapping; undo and give up.
                for page in &pages {
                    let _ = proc.spt.remove(page.va);
                }
                handle.close(fs);
                return Err(());
            }
            pages.push(page);
        }

        Ok(proc.mmaps.insert(handle, pages))
    }

    /// Unmaps mapping `id`: resident dirty pages are written back to
    /// the file (truncated to the file length), every page is
    /// discarded, and the mapping's file handle is closed.
    pub fn munmap(&self, fs: &Tfs, proc: &Proc, id: usize) -> Result<(), ()> {
        let mapping = proc.mmaps.remove(id).ok_or(())?;

        for page in &mapping.pages {
            let mut state = page.state.lock();
            if let PageLoc::Memory(frame) = &*state {
                if page.mmu.is_dirty(page.va) {
                    if let Backing::Mmap { file, offset } = &page.backing {
                        write_back_mmap(fs, file, *offset, frame);
                    }
                }
                page.mmu.unmap(page.va);
                self.frames().free(frame);
            }
            *state = PageLoc::NotPresent;
            drop(state);
            let _ = proc.spt.remove(page.va);
        }

        mapping.file.close(fs);
        Ok(())
    }
}
