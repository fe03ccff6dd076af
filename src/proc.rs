//! Per-process state and lifecycle contracts with the file system and
//! virtual memory.
//!
//! The scheduler and trap plumbing live outside this crate; a `Proc`
//! here is the bag of state those collaborators act on: the open-file
//! table, the current directory (held open), the supplemental page
//! table, live mmaps, the executable handle (opened with writes
//! denied), and the process's page-table hardware.
//!
//! Creation hands back an empty supplemental page table; the loader
//! then registers lazy executable pages through `Vm::map_segment`.
//! Exit runs the cleanup walks: close descriptors, write back and
//! discard mmaps, release every page's frame or swap slot, release the
//! executable's write denial, drop the current directory.

use alloc::sync::Arc;

use array_macro::array;

use crate::file::File;
use crate::fs::{Inode, Tfs};
use crate::hal::Mmu;
use crate::lock::SpinLock;
use crate::param::NOFILE;
use crate::vm::{MmapTable, Spt, Vm};

/// Per-process open-file table. Descriptors 0 and 1 are the console's
/// and never occupy a slot here.
pub struct FdTable {
    files: [Option<Arc<File>>; NOFILE],
}

impl FdTable {
    fn new() -> Self {
        Self {
            files: array![_ => None; NOFILE],
        }
    }

    /// Places `file` in the lowest free slot, returning its descriptor.
    fn alloc(&mut self, file: Arc<File>) -> Result<usize, ()> {
        for (i, slot) in self.files.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(file);
                return Ok(i + 2);
            }
        }
        Err(())
    }

    fn get(&self, fd: usize) -> Option<Arc<File>> {
        let idx = fd.checked_sub(2)?;
        self.files.get(idx)?.clone()
    }

    fn take(&mut self, fd: usize) -> Option<Arc<File>> {
        let idx = fd.checked_sub(2)?;
        self.files.get_mut(idx)?.take()
    }
}

pub struct Proc {
    pub pid: usize,

    /// Current directory, held open for the process's lifetime.
    cwd: SpinLock<Option<Arc<Inode>>>,

    files: SpinLock<FdTable>,

    /// Supplemental page table.
    pub spt: Spt,

    /// Live memory mappings.
    pub mmaps: MmapTable,

    /// This process's page-table hardware.
    pub mmu: Arc<dyn Mmu>,

    /// The executable image, held open with writes denied.
    executable: SpinLock<Option<Arc<File>>>,
}

impl Proc {
    /// Creates a process rooted at `/` with an empty supplemental page
    /// table.
    pub fn new(fs: &Tfs, mmu: Arc<dyn Mmu>, pid: usize) -> Result<Arc<Proc>, ()> {
        let root = fs.itable().open(fs, crate::fs::ROOT_DIR_SECTOR)?;
        Ok(Arc::new(Proc {
            pid,
            cwd: SpinLock::new("proc cwd", Some(root)),
            files: SpinLock::new("proc files", FdTable::new()),
            spt: Spt::new(),
            mmaps: MmapTable::new(),
            mmu,
            executable: SpinLock::new("proc exec", None),
        }))
    }

    /// Sector of the current directory's inode.
    pub fn cwd_sector(&self) -> Option<u32> {
        self.cwd.lock().as_ref().map(|inode| inode.sector)
    }

    /// Installs `new` as the current directory, returning the old one
    /// for the caller to close.
    pub(crate) fn swap_cwd(&self, new: Arc<Inode>) -> Option<Arc<Inode>> {
        self.cwd.lock().replace(new)
    }

    /// Opens `path` and binds it to a descriptor.
    pub fn open_fd(&self, fs: &Tfs, path: &str) -> Result<usize, ()> {
        let file = fs.open(self, path)?;
        match self.files.lock().alloc(Arc::clone(&file)) {
            Ok(fd) => Ok(fd),
            Err(()) => {
                file.close(fs);
                Err(())
            }
        }
    }

    /// The file bound to `fd`, if any.
    pub fn file(&self, fd: usize) -> Option<Arc<File>> {
        self.files.lock().get(fd)
    }

    /// Closes `fd`.
    pub fn close_fd(&self, fs: &Tfs, fd: usize) -> Result<(), ()> {
        let file = self.files.lock().take(fd).ok_or(())?;
        file.close(fs);
        Ok(())
    }

    /// Adopts `file` as the executable image, denying writes to it
    /// until exit.
    pub fn set_executable(&self, file: Arc<File>) {
        file.deny_write();
        let mut slot = self.executable.lock();
        assert!(slot.is_none(), "proc: executable already set");
        *slot = Some(file);
    }

    pub fn executable(&self) -> Option<Arc<File>> {
        self.executable.lock().clone()
    }

    /// Releases everything the process holds. The thread itself is the
    /// scheduler's to reap.
    pub fn exit(&self, fs: &Tfs, vm: &Vm) {
        // Descriptors first; mmaps keep their own handles.
        for fd in 2..2 + NOFILE {
            let file = self.files.lock().take(fd);
            if let Some(file) = file {
                file.close(fs);
            }
        }

        // Write back and discard every mapping.
        for id in self.mmaps.ids() {
            let _ = vm.munmap(fs, self, id);
        }

        // Free the remaining pages' frames and swap slots.
        for page in self.spt.take_all() {
            vm.release_page(&page);
        }

        // The executable: re-allow writes (via close) and drop it.
        let exec = self.executable.lock().take();
        if let Some(file) = exec {
            file.close(fs);
        }

        let cwd = self.cwd.lock().take();
        if let Some(inode) = cwd {
            fs.itable().close(fs, inode);
        }
    }
}
