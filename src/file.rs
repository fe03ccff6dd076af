//! Open file handles.
//!
//! A `File` pairs an open inode with a private position and an optional
//! write-denial mark. Every handle method is a top-level file-system
//! operation and takes the file-system lock itself; callers never lock
//! around these.

use alloc::sync::Arc;

use arrayvec::ArrayString;

use crate::fs::{Dir, Inode, Tfs, DIRENT_SIZE, DIRSIZ};
use crate::lock::SpinLock;

struct FileMeta {
    /// Byte position of the next read or write; doubles as the entry
    /// cursor when the handle is a directory.
    pos: u32,

    /// Whether this handle has denied writes to the inode.
    denies_write: bool,
}

pub struct File {
    inode: Arc<Inode>,
    meta: SpinLock<FileMeta>,
}

impl File {
    /// Wraps an already-opened inode. The handle owns that reference
    /// and surrenders it in `close`.
    pub(crate) fn new(inode: Arc<Inode>) -> Arc<File> {
        Arc::new(File {
            inode,
            meta: SpinLock::new(
                "file",
                FileMeta {
                    pos: 0,
                    denies_write: false,
                },
            ),
        })
    }

    /// Opens an independent handle to the same inode, with its own
    /// position and no write denial.
    pub fn reopen(&self, fs: &Tfs) -> Result<Arc<File>, ()> {
        let _op = fs.begin_op();
        let inode = fs.itable().open(fs, self.inode.sector)?;
        Ok(File::new(inode))
    }

    /// Closes the handle. Releases the write denial, if any, then the
    /// inode reference.
    pub fn close(self: Arc<Self>, fs: &Tfs) {
        let _op = fs.begin_op();
        let denies = self.meta.lock().denies_write;
        if denies {
            self.inode.allow_write();
        }
        fs.itable().close(fs, Arc::clone(&self.inode));
    }

    /// Reads at the handle position, advancing it by the bytes read.
    pub fn read(&self, fs: &Tfs, buf: &mut [u8]) -> usize {
        let _op = fs.begin_op();
        let pos = self.meta.lock().pos;
        let n = self.inode.read_at(fs, buf, pos);
        self.meta.lock().pos = pos + n as u32;
        n
    }

    /// Writes at the handle position, advancing it by the bytes
    /// written.
    pub fn write(&self, fs: &Tfs, buf: &[u8]) -> usize {
        let _op = fs.begin_op();
        let pos = self.meta.lock().pos;
        let n = self.inode.write_at(fs, buf, pos);
        self.meta.lock().pos = pos + n as u32;
        n
    }

    /// Reads at an explicit offset without touching the position.
    pub fn read_at(&self, fs: &Tfs, buf: &mut [u8], offset: u32) -> usize {
        let _op = fs.begin_op();
        self.inode.read_at(fs, buf, offset)
    }

    /// Writes at an explicit offset without touching the position.
    pub fn write_at(&self, fs: &Tfs, buf: &[u8], offset: u32) -> usize {
        let _op = fs.begin_op();
        self.inode.write_at(fs, buf, offset)
    }

    /// Moves the handle position to `pos` (which may be past the end).
    pub fn seek(&self, pos: u32) {
        self.meta.lock().pos = pos;
    }

    /// Current handle position.
    pub fn tell(&self) -> u32 {
        self.meta.lock().pos
    }

    /// File length in bytes.
    pub fn len(&self, fs: &Tfs) -> u32 {
        let _op = fs.begin_op();
        self.inode.length()
    }

    pub fn is_empty(&self, fs: &Tfs) -> bool {
        self.len(fs) == 0
    }

    /// Forbids writes to the underlying inode through any handle for
    /// this handle's lifetime. Idempotent per handle.
    pub fn deny_write(&self) {
        let mut meta = self.meta.lock();
        if !meta.denies_write {
            meta.denies_write = true;
            self.inode.deny_write();
        }
    }

    /// Revokes this handle's write denial.
    pub fn allow_write(&self) {
        let mut meta = self.meta.lock();
        if meta.denies_write {
            meta.denies_write = false;
            self.inode.allow_write();
        }
    }

    /// Inode sector, which doubles as the inode number.
    pub fn inumber(&self) -> u32 {
        self.inode.sector
    }

    pub fn is_dir(&self) -> bool {
        self.inode.is_dir()
    }

    /// When the handle is a directory: returns the next in-use entry
    /// name, using the handle position as the cursor.
    pub fn readdir(&self, fs: &Tfs) -> Option<ArrayString<DIRSIZ>> {
        let _op = fs.begin_op();
        let inode = fs.itable().open(fs, self.inode.sector).ok()?;
        let dir = match Dir::open(inode) {
            Ok(dir) => dir,
            Err(inode) => {
                fs.itable().close(fs, inode);
                return None;
            }
        };
        let mut cursor = self.meta.lock().pos / DIRENT_SIZE as u32;
        let name = dir.readdir(fs, &mut cursor);
        dir.close(fs);
        self.meta.lock().pos = cursor * DIRENT_SIZE as u32;
        name
    }

    pub(crate) fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }
}
