//! Kernel lifecycle.
//!
//! Process-wide state — the buffer cache, open-inode table, free map,
//! frame table and swap bitmap — is initialized exactly once here, at
//! boot, and torn down at shutdown. Nothing initializes lazily on first
//! use, so bring-up ordering stays testable.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::fs::Tfs;
use crate::hal::{BlockDevice, Mmu};
use crate::param::FLUSH_INTERVAL;
use crate::proc::Proc;
use crate::vm::Vm;

pub struct Kernel {
    pub fs: Tfs,
    pub vm: Vm,
    next_pid: AtomicUsize,
}

impl Kernel {
    /// Boots the core: mounts (or formats) the file system on `fs_dev`
    /// and builds the VM over `swap_dev` and a `user_pages`-page pool.
    pub fn new(
        fs_dev: Arc<dyn BlockDevice>,
        swap_dev: Arc<dyn BlockDevice>,
        user_pages: usize,
        format: bool,
    ) -> Result<Kernel, ()> {
        Ok(Kernel {
            fs: Tfs::mount(fs_dev, format)?,
            vm: Vm::new(swap_dev, user_pages),
            next_pid: AtomicUsize::new(1),
        })
    }

    /// Creates a process with an empty supplemental page table, rooted
    /// at `/`.
    pub fn spawn(&self, mmu: Arc<dyn Mmu>) -> Result<Arc<Proc>, ()> {
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        Proc::new(&self.fs, mmu, pid)
    }

    /// Timer hook: the platform calls this every tick; every
    /// `FLUSH_INTERVAL` ticks the buffer cache is flushed.
    pub fn on_tick(&self, ticks: u64) {
        if ticks % FLUSH_INTERVAL == 0 {
            self.fs.flush();
        }
    }

    /// Final flush and free-map write-back.
    pub fn shutdown(&self) {
        self.fs.shutdown();
    }
}
