//! Virtual memory.
//!
//! Demand paging over a fixed pool of physical frames. A page fault
//! consults the faulting process's supplemental page table, takes the
//! page's lock, and materializes the page: from a swap slot, from the
//! executable, from an mmapped file, or as fresh zeros. When the user
//! pool is exhausted the clock hand sweeps the frame table for a
//! second-chance victim, whose page is written out under its own lock.
//!
//! Lock order on the fault path is page lock, then frame-table lock,
//! then (for file-backed pages) the file-system lock. The evictor takes
//! a *victim's* page lock only with `try_lock`: a page lock is also
//! held while acquiring the frame-table lock on the fault path, and
//! blocking here would close the cycle.

use alloc::sync::Arc;
use core::mem;

use crate::file::File;
use crate::fs::Tfs;
use crate::hal::BlockDevice;
use crate::lock::SleepLockGuard;
use crate::param::{
    pg_round_down, pg_round_up, PGSIZE, STACK_LIMIT, STACK_SLOP, USER_TOP,
};
use crate::proc::Proc;

mod frame;
mod mmap;
mod page;
mod swap;

pub use frame::{AllocFlags, Frame, FrameTable};
pub use mmap::MmapTable;
pub use page::{Backing, LocKind, Page, PageLoc, Spt};
pub use swap::{SwapSlot, SwapTable};

pub struct Vm {
    frames: FrameTable,
    swap: SwapTable,
}

impl Vm {
    /// Builds the frame table over a `user_pages`-page pool and the
    /// swap area over `swap_dev`.
    pub fn new(swap_dev: Arc<dyn BlockDevice>, user_pages: usize) -> Self {
        Self {
            frames: FrameTable::new(user_pages),
            swap: SwapTable::new(swap_dev),
        }
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapTable {
        &self.swap
    }

    /// Handles a fault at `addr` with user stack pointer `esp`.
    /// Returns `Err` when the access is invalid and the process should
    /// be terminated.
    pub fn handle_fault(&self, fs: &Tfs, proc: &Proc, addr: usize, esp: usize) -> Result<(), ()> {
        if addr >= USER_TOP {
            return Err(());
        }

        if let Some(page) = proc.spt.find(addr) {
            let mut state = page.state.lock();
            if state.kind() != LocKind::Memory {
                self.swap_in(fs, &page, &mut state);
            }
            return Ok(());
        }

        // No record: grow the stack if the address plausibly belongs to
        // it (at or above esp - 32, within the stack region).
        if addr + STACK_SLOP >= esp && addr >= USER_TOP - STACK_LIMIT {
            return self.stack_growth(fs, proc, addr);
        }
        Err(())
    }

    /// Creates a writable anonymous page at `addr`'s page and backs it
    /// with a zeroed frame immediately.
    pub fn stack_growth(&self, fs: &Tfs, proc: &Proc, addr: usize) -> Result<(), ()> {
        let base = pg_round_down(addr);
        let page = Arc::new(Page::new(
            proc.pid,
            base,
            true,
            Backing::Anon,
            Arc::clone(&proc.mmu),
        ));
        // Take the page lock before publishing the record, so a
        // concurrent faulter on the same page waits for the frame
        // instead of materializing a second one.
        let mut state = page.state.lock();
        proc.spt.insert(Arc::clone(&page))?;

        let frame = self.allocate_frame(fs, &page, AllocFlags::USER | AllocFlags::ZERO);
        page.mmu.map(base, frame.base(), true);
        *state = PageLoc::Memory(frame);
        Ok(())
    }

    /// Registers lazy executable pages: `read_bytes` bytes of `file` at
    /// `offset`, then `zero_bytes` zeros, starting at page `upage`.
    /// Nothing is loaded until the pages fault.
    pub fn map_segment(
        &self,
        proc: &Proc,
        file: &Arc<File>,
        offset: u32,
        upage: usize,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<(), ()> {
        assert_eq!(upage % PGSIZE, 0, "map_segment: unaligned page");
        assert_eq!(offset as usize % PGSIZE, 0, "map_segment: unaligned offset");
        assert_eq!(
            (read_bytes + zero_bytes) % PGSIZE,
            0,
            "map_segment: partial page"
        );

        let mut va = upage;
        let mut offset = offset;
        let mut remaining = read_bytes;
        let npages = (read_bytes + zero_bytes) / PGSIZE;
        for _ in 0..npages {
            let page_read = remaining.min(PGSIZE);
            let page = Arc::new(Page::new(
                proc.pid,
                va,
                writable,
                Backing::Executable {
                    file: Arc::clone(file),
                    offset,
                    read_bytes: page_read as u32,
                },
                Arc::clone(&proc.mmu),
            ));
            proc.spt.insert(page)?;
            va += PGSIZE;
            offset += PGSIZE as u32;
            remaining -= page_read;
        }
        Ok(())
    }

    /// Materializes `page` into a frame. Called with the page lock held
    /// and the page not in memory.
    pub(crate) fn swap_in(
        &self,
        fs: &Tfs,
        page: &Arc<Page>,
        state: &mut SleepLockGuard<'_, PageLoc>,
    ) {
        debug_assert!(state.kind() != LocKind::Memory);
        let frame = self.allocate_frame(fs, page, AllocFlags::USER | AllocFlags::ZERO);

        // Map writable for population, then re-install with the page's
        // real permission.
        page.mmu.map(page.va, frame.base(), true);

        let old = mem::replace(&mut **state, PageLoc::NotPresent);
        match old {
            PageLoc::Swap(slot) => {
                frame.with_data(|data| self.swap.read_slot(&slot, data));
                self.swap.free(slot);
            }
            PageLoc::InFile | PageLoc::NotPresent => match &page.backing {
                Backing::Anon => {}
                Backing::Executable {
                    file,
                    offset,
                    read_bytes,
                } => {
                    let n = *read_bytes as usize;
                    if n > 0 {
                        frame.with_data(|data| {
                            let read = file.read_at(fs, &mut data[..n], *offset);
                            assert_eq!(read, n, "swap_in: short executable read");
                        });
                    }
                }
                Backing::Mmap { file, offset } => {
                    let len = file.len(fs);
                    let n = (len.saturating_sub(*offset) as usize).min(PGSIZE);
                    if n > 0 {
                        frame.with_data(|data| {
                            let read = file.read_at(fs, &mut data[..n], *offset);
                            assert_eq!(read, n, "swap_in: short mmap read");
                        });
                    }
                }
            },
            PageLoc::Memory(_) => unreachable!("swap_in: already resident"),
        }

        page.mmu.map(page.va, frame.base(), page.writable);
        **state = PageLoc::Memory(frame);
    }

    /// Writes `victim` out of memory. Called with the victim's page
    /// lock held and the victim in `frame`.
    ///
    /// Anonymous pages and dirty executable pages go to a fresh swap
    /// slot; clean file-backed pages are discarded; dirty mmap pages
    /// are written back to their file window.
    fn swap_out(
        &self,
        fs: &Tfs,
        victim: &Page,
        state: &mut SleepLockGuard<'_, PageLoc>,
        frame: &Arc<Frame>,
    ) {
        let dirty = victim.mmu.is_dirty(victim.va);
        victim.mmu.clear_dirty(victim.va);
        victim.mmu.unmap(victim.va);

        let next = match &victim.backing {
            Backing::Anon => {
                let slot = self.swap.allocate();
                frame.with_data(|data| self.swap.write_slot(&slot, data));
                PageLoc::Swap(slot)
            }
            Backing::Executable { .. } => {
                if dirty {
                    let slot = self.swap.allocate();
                    frame.with_data(|data| self.swap.write_slot(&slot, data));
                    PageLoc::Swap(slot)
                } else {
                    PageLoc::InFile
                }
            }
            Backing::Mmap { file, offset } => {
                if dirty {
                    write_back_mmap(fs, file, *offset, frame);
                }
                PageLoc::InFile
            }
        };
        // Dropping the old location releases the frame reference.
        **state = next;
    }

    /// Acquires a frame for `page`: from the user pool if it has room,
    /// otherwise by evicting the second-chance victim under the clock
    /// hand. Called with `page`'s lock held.
    pub(crate) fn allocate_frame(&self, fs: &Tfs, page: &Arc<Page>, flags: AllocFlags) -> Arc<Frame> {
        if let Some(frame) = self.frames.grab_fresh(page, flags) {
            return frame;
        }

        let mut examined = 0;
        loop {
            let frame = self.frames.clock_next();
            examined += 1;
            if examined % self.frames.capacity() == 0 {
                // A full sweep found nothing; give pinners a chance.
                core::hint::spin_loop();
            }

            if frame.is_pinned() {
                continue;
            }
            let victim = match frame.owner_page().upgrade() {
                Some(victim) => victim,
                // Owner mid-teardown; its exit path frees the frame.
                None => continue,
            };

            // Second chance: recently used pages get their accessed bit
            // cleared and another trip around the clock.
            if victim.mmu.is_accessed(victim.va) {
                victim.mmu.clear_accessed(victim.va);
                continue;
            }

            let mut state = match victim.state.try_lock() {
                Some(state) => state,
                None => continue,
            };
            match &*state {
                PageLoc::Memory(owned) if Arc::ptr_eq(owned, &frame) => {}
                // The frame changed hands since we looked at it.
                _ => continue,
            }

            self.swap_out(fs, &victim, &mut state, &frame);
            frame.rebind(page, flags.contains(AllocFlags::ZERO));
            return frame;
        }
    }

    /// Copies `src` into the process's memory at `va`, faulting pages
    /// in and pinning each frame for the duration of its chunk. Fails
    /// on an untracked or read-only page.
    pub fn copy_out(&self, fs: &Tfs, proc: &Proc, va: usize, src: &[u8]) -> Result<(), ()> {
        self.walk_user(fs, proc, va, src.len(), true, |frame, pg_ofs, done, chunk| {
            frame.with_data(|data| {
                data[pg_ofs..pg_ofs + chunk].copy_from_slice(&src[done..done + chunk])
            });
        })
    }

    /// Copies `dst.len()` bytes out of the process's memory at `va`.
    pub fn copy_in(&self, fs: &Tfs, proc: &Proc, va: usize, dst: &mut [u8]) -> Result<(), ()> {
        self.walk_user(fs, proc, va, dst.len(), false, |frame, pg_ofs, done, chunk| {
            frame.with_data(|data| {
                dst[done..done + chunk].copy_from_slice(&data[pg_ofs..pg_ofs + chunk])
            });
        })
    }

    fn walk_user(
        &self,
        fs: &Tfs,
        proc: &Proc,
        va: usize,
        len: usize,
        write: bool,
        mut f: impl FnMut(&Arc<Frame>, usize, usize, usize),
    ) -> Result<(), ()> {
        let mut done = 0;
        while done < len {
            let addr = va + done;
            let page = proc.spt.find(addr).ok_or(())?;
            if write && !page.writable {
                return Err(());
            }

            let mut state = page.state.lock();
            if state.kind() != LocKind::Memory {
                self.swap_in(fs, &page, &mut state);
            }
            let frame = match &*state {
                PageLoc::Memory(frame) => Arc::clone(frame),
                _ => unreachable!("walk_user: swap_in left page absent"),
            };

            frame.set_pinned(true);
            let frame = scopeguard::guard(frame, |frame| frame.set_pinned(false));
            let pg_ofs = addr % PGSIZE;
            let chunk = (len - done).min(PGSIZE - pg_ofs);
            f(&frame, pg_ofs, done, chunk);
            page.mmu.mark_access(page.va, write);
            done += chunk;
        }
        Ok(())
    }

    /// Faults in and pins every page covering `[va, va + len)`.
    /// Pinned frames are skipped by the clock hand; pair with
    /// `unpin_range` on syscall exit.
    pub fn pin_range(&self, fs: &Tfs, proc: &Proc, va: usize, len: usize) -> Result<(), ()> {
        for base in num_iter::range_step(pg_round_down(va), pg_round_up(va + len), PGSIZE) {
            let page = proc.spt.find(base).ok_or(())?;
            let mut state = page.state.lock();
            if state.kind() != LocKind::Memory {
                self.swap_in(fs, &page, &mut state);
            }
            if let PageLoc::Memory(frame) = &*state {
                frame.set_pinned(true);
            }
        }
        Ok(())
    }

    pub fn unpin_range(&self, proc: &Proc, va: usize, len: usize) {
        for base in num_iter::range_step(pg_round_down(va), pg_round_up(va + len), PGSIZE) {
            if let Some(page) = proc.spt.find(base) {
                let state = page.state.lock();
                if let PageLoc::Memory(frame) = &*state {
                    frame.set_pinned(false);
                }
            }
        }
    }

    /// Releases every resource a drained page record still owns.
    /// Used by process exit after mmaps are gone.
    pub(crate) fn release_page(&self, page: &Page) {
        let mut state = page.state.lock();
        match mem::replace(&mut *state, PageLoc::NotPresent) {
            PageLoc::Memory(frame) => {
                page.mmu.unmap(page.va);
                self.frames.free(&frame);
            }
            PageLoc::Swap(slot) => self.swap.free(slot),
            PageLoc::NotPresent | PageLoc::InFile => {}
        }
    }
}

/// Writes a resident mmap page back to its file window, truncated to
/// the file length.
pub(crate) fn write_back_mmap(fs: &Tfs, file: &Arc<File>, offset: u32, frame: &Arc<Frame>) {
    let len = file.len(fs);
    let n = (len.saturating_sub(offset) as usize).min(PGSIZE);
    if n > 0 {
        frame.with_data(|data| {
            let written = file.write_at(fs, &data[..n], offset);
            assert_eq!(written, n, "mmap: short write-back");
        });
    }
}
