//! File system implementation. Four layers:
//!   + Free map: allocator for raw disk sectors.
//!   + Inodes: doubly-indirect block index, reading, writing, growth.
//!   + Directories: inodes with special contents (lists of other inodes).
//!   + Names: paths like /usr/kim/notes for convenient naming.
//!
//! This module contains the top-level entry points: mounting and
//! formatting, shutdown, and the path-based operations the syscall
//! layer exposes (create, open, remove, mkdir, chdir). Each entry point
//! runs under the single file-system lock; the byte-level machinery
//! below it has its own finer locks.
//!
//! On-disk layout: sector 0 holds the inode of the free-map file,
//! sector 1 the inode of the root directory. Everything else is
//! allocated through the free map.

use alloc::sync::Arc;
use alloc::vec;

use spin::Once;

use crate::bio::Bcache;
use crate::file::File;
use crate::hal::BlockDevice;
use crate::lock::{SleepLock, SleepLockGuard};
use crate::proc::Proc;

mod dir;
mod freemap;
mod inode;
mod path;

pub use dir::{Dir, Dirent, DIRENT_SIZE, DIRSIZ, DIR_INIT_ENTRIES};
pub use freemap::FreeMap;
pub use inode::{
    bytes_to_sectors, Inode, InodeInner, Itable, INODE_MAGIC, MAXFILE, MAX_FILE_SECTORS,
    PTRS_PER_SECTOR,
};
pub use path::Action;

/// Sector of the free-map file's inode.
pub const FREE_MAP_SECTOR: u32 = 0;

/// Sector of the root directory's inode.
pub const ROOT_DIR_SECTOR: u32 = 1;

pub struct Tfs {
    dev: Arc<dyn BlockDevice>,
    bcache: Bcache,
    itable: Itable,
    freemap: Once<FreeMap>,

    /// The file-system lock. One top-level operation at a time.
    lock: SleepLock<()>,
}

impl Tfs {
    /// Mounts the file system on `dev`, formatting it first when
    /// `format` is set.
    pub fn mount(dev: Arc<dyn BlockDevice>, format: bool) -> Result<Tfs, ()> {
        let fs = Tfs {
            bcache: Bcache::new(Arc::clone(&dev)),
            dev,
            itable: Itable::new(),
            freemap: Once::new(),
            lock: SleepLock::new("filesys", ()),
        };
        if format {
            fs.format()?;
        } else {
            fs.load_freemap()?;
        }
        Ok(fs)
    }

    /// Builds an empty file system: a free map covering the whole
    /// device and a root directory that is its own parent.
    fn format(&self) -> Result<(), ()> {
        let map = FreeMap::new(self.dev.size());
        map.mark(FREE_MAP_SECTOR, 1);
        map.mark(ROOT_DIR_SECTOR, 1);
        let _ = self.freemap.call_once(|| map);

        Dir::create(self, ROOT_DIR_SECTOR, ROOT_DIR_SECTOR)?;
        Inode::create(
            self,
            FREE_MAP_SECTOR,
            self.freemap().byte_len() as u32,
            false,
            ROOT_DIR_SECTOR,
        )?;
        self.store_freemap()
    }

    /// Loads the persisted free map from its file.
    fn load_freemap(&self) -> Result<(), ()> {
        let map = FreeMap::new(self.dev.size());
        let inode = self.itable.open(self, FREE_MAP_SECTOR)?;
        let mut image = vec![0; map.byte_len()];
        let read = inode.read_at(self, &mut image, 0);
        self.itable.close(self, inode);
        if read != image.len() {
            return Err(());
        }
        map.load(&image);
        let _ = self.freemap.call_once(|| map);
        Ok(())
    }

    /// Writes the in-memory free map into its file.
    fn store_freemap(&self) -> Result<(), ()> {
        let mut image = vec![0; self.freemap().byte_len()];
        self.freemap().store(&mut image);
        let inode = self.itable.open(self, FREE_MAP_SECTOR)?;
        let written = inode.write_at(self, &image, 0);
        self.itable.close(self, inode);
        if written != image.len() {
            return Err(());
        }
        Ok(())
    }

    /// Writes any unwritten state to disk. The final flush: call once,
    /// at shutdown.
    pub fn shutdown(&self) {
        let _op = self.lock.lock();
        let _ = self.store_freemap();
        self.bcache.flush();
    }

    /// Acquires the file-system lock for one top-level operation.
    pub(crate) fn begin_op(&self) -> SleepLockGuard<'_, ()> {
        self.lock.lock()
    }

    pub(crate) fn bcache(&self) -> &Bcache {
        &self.bcache
    }

    pub(crate) fn freemap(&self) -> &FreeMap {
        self.freemap.get().expect("fs: free map not loaded")
    }

    pub fn itable(&self) -> &Itable {
        &self.itable
    }

    /// Writes every dirty cached sector to the device. A platform task
    /// calls this every `FLUSH_INTERVAL` ticks.
    pub fn flush(&self) {
        self.bcache.flush();
    }

    /// Number of sectors marked allocated, for invariant checks.
    pub fn allocated_sectors(&self) -> u32 {
        self.freemap().count_allocated()
    }

    /// Creates a file of `initial_size` zeroed bytes at `path`.
    pub fn create(&self, proc: &Proc, path: &str, initial_size: u32) -> Result<(), ()> {
        let _op = self.begin_op();
        let _ = self.resolve(proc, path, Action::CreateFile { size: initial_size })?;
        Ok(())
    }

    /// Creates a directory at `path` inside its parent directory.
    pub fn mkdir(&self, proc: &Proc, path: &str) -> Result<(), ()> {
        let _op = self.begin_op();
        let _ = self.resolve(proc, path, Action::MakeDir)?;
        Ok(())
    }

    /// Opens the file or directory at `path`.
    pub fn open(&self, proc: &Proc, path: &str) -> Result<Arc<File>, ()> {
        let _op = self.begin_op();
        let sector = self.resolve(proc, path, Action::Lookup)?;
        let inode = self.itable.open(self, sector)?;
        Ok(File::new(inode))
    }

    /// Removes the file or empty directory at `path`. The inode's
    /// blocks are released when its last opener closes it.
    pub fn remove(&self, proc: &Proc, path: &str) -> Result<(), ()> {
        let _op = self.begin_op();
        let _ = self.resolve(proc, path, Action::Remove)?;
        Ok(())
    }

    /// Changes `proc`'s current directory to `path`.
    pub fn chdir(&self, proc: &Proc, path: &str) -> Result<(), ()> {
        let _op = self.begin_op();
        let sector = self.resolve(proc, path, Action::Lookup)?;
        let inode = self.itable.open(self, sector)?;
        if !inode.is_dir() {
            self.itable.close(self, inode);
            return Err(());
        }
        let old = proc.swap_cwd(inode);
        if let Some(old) = old {
            self.itable.close(self, old);
        }
        Ok(())
    }
}
