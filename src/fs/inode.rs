//! Inodes.
//!
//! An inode describes a single unnamed file or directory. The on-disk
//! image occupies exactly one sector and holds the byte length, the
//! directory flag, the parent directory's inode sector and the root of
//! the block index: one doubly-indirect sector of 128 pointers to
//! indirect sectors, each holding 128 pointers to data sectors, for a
//! maximum file size of 8 MiB.
//!
//! The kernel keeps a table of open inodes in memory so that opening a
//! sector already open returns the same `Inode` and bumps its open
//! count. Disk blocks of a removed inode are released only on the final
//! close.
//!
//! Locking: the open-inode list has its own lock; each inode carries a
//! lock for its counters, a lock for its cached disk image, and a
//! long-term growth lock serializing file extension. Readers never take
//! the growth lock: they see the old length until the new one is
//! published, which happens only after every new sector is linked.

use alloc::sync::Arc;
use alloc::vec::Vec;

use static_assertions::const_assert;

use crate::lock::{SleepLock, SpinLock};
use crate::param::BSIZE;

use super::Tfs;

/// Identifies an inode sector.
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// Sector pointers per indirect or doubly-indirect sector.
pub const PTRS_PER_SECTOR: usize = BSIZE / 4;

/// Largest file the index can address, in sectors and in bytes.
pub const MAX_FILE_SECTORS: usize = PTRS_PER_SECTOR * PTRS_PER_SECTOR;
pub const MAXFILE: usize = MAX_FILE_SECTORS * BSIZE;

/// Bytes of the on-disk image that carry data; the rest of the sector
/// is padding.
const IMG_BYTES: usize = 20;
const_assert!(IMG_BYTES <= BSIZE);

/// Returns the number of data sectors backing `size` bytes.
pub const fn bytes_to_sectors(size: u32) -> u32 {
    (size + BSIZE as u32 - 1) / BSIZE as u32
}

/// In-memory copy of the on-disk inode metadata.
///
/// On disk the fields sit at the head of the sector, little-endian:
/// `length | is_dir | parent | doubly_indirect | magic`, each four
/// bytes, padded out to one sector.
#[derive(Clone, Copy)]
pub struct InodeInner {
    /// File size in bytes.
    pub length: u32,

    pub is_dir: bool,

    /// Inode sector of the containing directory. The root is its own
    /// parent.
    pub parent: u32,

    /// Sector of the doubly-indirect block.
    pub doubly_indirect: u32,
}

/// Reads and decodes the image at `sector`. A corrupt magic number is
/// an invariant violation.
fn load_inner(fs: &Tfs, sector: u32) -> InodeInner {
    let mut raw = [0; IMG_BYTES];
    fs.bcache().read(sector, 0, &mut raw);
    let word = |i: usize| u32::from_le_bytes([raw[4 * i], raw[4 * i + 1], raw[4 * i + 2], raw[4 * i + 3]]);
    assert_eq!(word(4), INODE_MAGIC, "inode: bad magic in sector {}", sector);
    InodeInner {
        length: word(0),
        is_dir: word(1) != 0,
        parent: word(2),
        doubly_indirect: word(3),
    }
}

/// Encodes `inner` and writes the full image sector.
fn store_inner(fs: &Tfs, sector: u32, inner: &InodeInner) {
    let mut raw = [0; BSIZE];
    raw[0..4].copy_from_slice(&inner.length.to_le_bytes());
    raw[4..8].copy_from_slice(&(inner.is_dir as u32).to_le_bytes());
    raw[8..12].copy_from_slice(&inner.parent.to_le_bytes());
    raw[12..16].copy_from_slice(&inner.doubly_indirect.to_le_bytes());
    raw[16..20].copy_from_slice(&INODE_MAGIC.to_le_bytes());
    fs.bcache().write(sector, 0, &raw);
}

/// Book-keeping that is not stored on disk.
struct Counts {
    /// Number of openers (open files and current directories).
    open: u32,

    /// Writes return 0 bytes while this is positive.
    deny_write: u32,

    /// Release disk blocks on final close.
    removed: bool,
}

/// In-memory inode.
pub struct Inode {
    /// Sector holding the on-disk image; doubles as the inode number.
    pub sector: u32,

    cnt: SpinLock<Counts>,

    /// Cached copy of the disk image.
    img: SpinLock<InodeInner>,

    /// Serializes file growth. Readers of the old length proceed
    /// unimpeded while an extension is in progress.
    growth: SleepLock<()>,
}

/// The open-inode table.
pub struct Itable {
    list: SpinLock<Vec<Arc<Inode>>>,
}

impl Itable {
    pub const fn new() -> Self {
        Self {
            list: SpinLock::new("itable", Vec::new()),
        }
    }

    /// Returns the canonical in-memory inode for `sector`, reading the
    /// image from disk if it is not yet open, and increments its open
    /// count.
    pub fn open(&self, fs: &Tfs, sector: u32) -> Result<Arc<Inode>, ()> {
        if let Some(inode) = self.reopen(sector) {
            return Ok(inode);
        }

        // Not open: read the image without holding the list lock, then
        // recheck. A racing open of the same sector may have won.
        let img = load_inner(fs, sector);

        let mut list = self.list.lock();
        if let Some(inode) = list.iter().find(|i| i.sector == sector) {
            inode.cnt.lock().open += 1;
            return Ok(Arc::clone(inode));
        }
        let inode = Arc::new(Inode {
            sector,
            cnt: SpinLock::new(
                "inode cnt",
                Counts {
                    open: 1,
                    deny_write: 0,
                    removed: false,
                },
            ),
            img: SpinLock::new("inode img", img),
            growth: SleepLock::new("inode growth", ()),
        });
        list.push(Arc::clone(&inode));
        Ok(inode)
    }

    /// Increments the open count of `sector` if it is already open.
    fn reopen(&self, sector: u32) -> Option<Arc<Inode>> {
        let list = self.list.lock();
        let inode = list.iter().find(|i| i.sector == sector)?;
        inode.cnt.lock().open += 1;
        Some(Arc::clone(inode))
    }

    /// Drops one reference to `inode`. On the final close of a removed
    /// inode, releases every data sector, every indirect sector, the
    /// doubly-indirect sector and the inode sector itself.
    pub fn close(&self, fs: &Tfs, inode: Arc<Inode>) {
        let removed = {
            let mut list = self.list.lock();
            let mut cnt = inode.cnt.lock();
            assert!(cnt.open > 0, "inode: close of closed inode");
            cnt.open -= 1;
            if cnt.open > 0 {
                return;
            }
            list.retain(|i| !Arc::ptr_eq(i, &inode));
            cnt.removed
        };

        if removed {
            inode.release_blocks(fs);
            fs.freemap().release(inode.sector, 1);
        }
    }

    /// Number of open inodes, for invariant checks.
    pub fn len(&self) -> usize {
        self.list.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inode {
    /// Builds a fresh on-disk inode at `sector` with `length` bytes of
    /// zeroed data. Allocates the doubly-indirect sector, then leaf
    /// sectors with indirect sectors at every 128-leaf boundary. On any
    /// allocation failure everything allocated so far is released and
    /// the image is not written.
    ///
    /// `sector` itself must already be allocated by the caller.
    pub fn create(fs: &Tfs, sector: u32, length: u32, is_dir: bool, parent: u32) -> Result<(), ()> {
        assert!(length as usize <= MAXFILE, "inode: create beyond max size");

        let mut inner = InodeInner {
            length,
            is_dir,
            parent,
            doubly_indirect: fs.freemap().allocate(1)?,
        };
        fs.bcache().zero(inner.doubly_indirect);

        let sectors = bytes_to_sectors(length);
        let mut indirect = 0;
        for i in 0..sectors {
            let leaf = match fs.freemap().allocate(1) {
                Ok(s) => s,
                Err(()) => {
                    Self::unwind_index(fs, inner.doubly_indirect, 0, i);
                    fs.freemap().release(inner.doubly_indirect, 1);
                    return Err(());
                }
            };
            fs.bcache().zero(leaf);
            if i as usize % PTRS_PER_SECTOR == 0 {
                indirect = match fs.freemap().allocate(1) {
                    Ok(s) => s,
                    Err(()) => {
                        fs.freemap().release(leaf, 1);
                        Self::unwind_index(fs, inner.doubly_indirect, 0, i);
                        fs.freemap().release(inner.doubly_indirect, 1);
                        return Err(());
                    }
                };
                fs.bcache().zero(indirect);
                write_ptr(fs, inner.doubly_indirect, i as usize / PTRS_PER_SECTOR, indirect);
            }
            write_ptr(fs, indirect, i as usize % PTRS_PER_SECTOR, leaf);
        }

        store_inner(fs, sector, &inner);
        Ok(())
    }

    /// Releases leaves `[first, upto)` of the index rooted at `doubly`,
    /// plus every indirect sector wholly owned by that range (those
    /// whose first leaf index is at or after `first`). `doubly` itself
    /// is the caller's to release.
    fn unwind_index(fs: &Tfs, doubly: u32, first: u32, upto: u32) {
        for j in first..upto {
            let indirect = read_ptr(fs, doubly, j as usize / PTRS_PER_SECTOR);
            let leaf = read_ptr(fs, indirect, j as usize % PTRS_PER_SECTOR);
            fs.freemap().release(leaf, 1);
            let block_start = j - j % PTRS_PER_SECTOR as u32;
            let last_of_block = j % PTRS_PER_SECTOR as u32 == PTRS_PER_SECTOR as u32 - 1;
            if (last_of_block || j == upto - 1) && block_start >= first {
                fs.freemap().release(indirect, 1);
            }
        }
    }

    /// Releases every block reachable from this inode's index. Called
    /// once, on the final close of a removed inode.
    fn release_blocks(&self, fs: &Tfs) {
        let img = *self.img.lock();
        Self::unwind_index(fs, img.doubly_indirect, 0, bytes_to_sectors(img.length));
        fs.freemap().release(img.doubly_indirect, 1);
    }

    /// Returns the data sector containing byte `pos`, or `None` if the
    /// inode has no data at that offset.
    fn byte_to_sector(&self, fs: &Tfs, pos: u32) -> Option<u32> {
        let img = *self.img.lock();
        if pos >= img.length {
            return None;
        }
        let n = pos as usize / BSIZE;
        let indirect = read_ptr(fs, img.doubly_indirect, n / PTRS_PER_SECTOR);
        Some(read_ptr(fs, indirect, n % PTRS_PER_SECTOR))
    }

    /// Reads up to `buf.len()` bytes starting at byte `offset`. Returns
    /// the number of bytes actually read; 0 at or past end of file.
    pub fn read_at(&self, fs: &Tfs, buf: &mut [u8], offset: u32) -> usize {
        let mut read = 0;
        while read < buf.len() {
            let pos = offset + read as u32;
            // Reread the length each chunk: a concurrent grower may have
            // published more data.
            let length = self.length();
            if pos >= length {
                break;
            }
            let sector = match self.byte_to_sector(fs, pos) {
                Some(s) => s,
                None => break,
            };
            let sector_ofs = pos as usize % BSIZE;
            let chunk = (buf.len() - read)
                .min(BSIZE - sector_ofs)
                .min((length - pos) as usize);
            fs.bcache()
                .read(sector, sector_ofs, &mut buf[read..read + chunk]);
            read += chunk;
        }
        read
    }

    /// Writes `buf` starting at byte `offset`, extending the file if
    /// `offset + buf.len()` exceeds the current length. Returns the
    /// number of bytes written: 0 if writes are denied, growth fails,
    /// or the write would exceed the maximum file size.
    pub fn write_at(&self, fs: &Tfs, buf: &[u8], offset: u32) -> usize {
        if self.cnt.lock().deny_write > 0 {
            return 0;
        }
        let end = match (offset as usize).checked_add(buf.len()) {
            Some(e) if e <= MAXFILE => offset + buf.len() as u32,
            _ => return 0,
        };

        {
            let growing = self.growth.lock();
            let old_len = self.img.lock().length;
            if end > old_len {
                if self.grow(fs, old_len, end).is_err() {
                    return 0;
                }
                // Publish the new length last: only now can a reader
                // reach the freshly linked sectors.
                let img = {
                    let mut img = self.img.lock();
                    img.length = end;
                    *img
                };
                store_inner(fs, self.sector, &img);
            }
            drop(growing);
        }

        let mut written = 0;
        while written < buf.len() {
            let pos = offset + written as u32;
            let sector = match self.byte_to_sector(fs, pos) {
                Some(s) => s,
                None => break,
            };
            let sector_ofs = pos as usize % BSIZE;
            let chunk = (buf.len() - written).min(BSIZE - sector_ofs);
            fs.bcache()
                .write(sector, sector_ofs, &buf[written..written + chunk]);
            written += chunk;
        }
        written
    }

    /// Allocates and links the leaf sectors `[sectors(old_len),
    /// sectors(new_len))`, with indirect sectors at 128-leaf
    /// boundaries. On failure releases everything allocated by this
    /// call.
    fn grow(&self, fs: &Tfs, old_len: u32, new_len: u32) -> Result<(), ()> {
        let old_sectors = bytes_to_sectors(old_len);
        let new_sectors = bytes_to_sectors(new_len);
        let doubly = self.img.lock().doubly_indirect;

        // Resume inside a partially filled indirect sector.
        let mut indirect = if old_sectors as usize % PTRS_PER_SECTOR != 0 {
            read_ptr(fs, doubly, old_sectors as usize / PTRS_PER_SECTOR)
        } else {
            0
        };

        for i in old_sectors..new_sectors {
            let leaf = match fs.freemap().allocate(1) {
                Ok(s) => s,
                Err(()) => {
                    Self::unwind_index(fs, doubly, old_sectors, i);
                    return Err(());
                }
            };
            fs.bcache().zero(leaf);
            if i as usize % PTRS_PER_SECTOR == 0 {
                indirect = match fs.freemap().allocate(1) {
                    Ok(s) => s,
                    Err(()) => {
                        fs.freemap().release(leaf, 1);
                        Self::unwind_index(fs, doubly, old_sectors, i);
                        return Err(());
                    }
                };
                fs.bcache().zero(indirect);
                write_ptr(fs, doubly, i as usize / PTRS_PER_SECTOR, indirect);
            }
            write_ptr(fs, indirect, i as usize % PTRS_PER_SECTOR, leaf);
        }
        Ok(())
    }

    /// File length in bytes.
    pub fn length(&self) -> u32 {
        self.img.lock().length
    }

    pub fn is_dir(&self) -> bool {
        self.img.lock().is_dir
    }

    /// Inode sector of the containing directory.
    pub fn parent(&self) -> u32 {
        self.img.lock().parent
    }

    /// Marks the inode for deletion on its final close.
    pub fn mark_removed(&self) {
        self.cnt.lock().removed = true;
    }

    pub fn is_removed(&self) -> bool {
        self.cnt.lock().removed
    }

    /// Disables writes through `write_at`.
    /// May be called at most once per opener.
    pub fn deny_write(&self) {
        let mut cnt = self.cnt.lock();
        cnt.deny_write += 1;
        assert!(cnt.deny_write <= cnt.open, "inode: deny_write > open");
    }

    /// Re-enables writes. Must pair with a prior `deny_write`.
    pub fn allow_write(&self) {
        let mut cnt = self.cnt.lock();
        assert!(cnt.deny_write > 0, "inode: allow_write without deny");
        cnt.deny_write -= 1;
    }

    pub fn open_cnt(&self) -> u32 {
        self.cnt.lock().open
    }

    pub fn deny_write_cnt(&self) -> u32 {
        self.cnt.lock().deny_write
    }
}

/// Reads the `idx`th sector pointer out of pointer sector `sector`.
fn read_ptr(fs: &Tfs, sector: u32, idx: usize) -> u32 {
    let mut raw = [0; 4];
    fs.bcache().read(sector, 4 * idx, &mut raw);
    u32::from_le_bytes(raw)
}

/// Writes the `idx`th sector pointer of pointer sector `sector`.
fn write_ptr(fs: &Tfs, sector: u32, idx: usize, value: u32) {
    fs.bcache().write(sector, 4 * idx, &value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::ROOT_DIR_SECTOR;
    use crate::hal::MemDisk;

    fn tfs(sectors: u32) -> Tfs {
        Tfs::mount(Arc::new(MemDisk::new(sectors)), true).expect("mount")
    }

    fn new_inode(fs: &Tfs, length: u32) -> Arc<Inode> {
        let sector = fs.freemap().allocate(1).unwrap();
        Inode::create(fs, sector, length, false, ROOT_DIR_SECTOR).unwrap();
        fs.itable().open(fs, sector).unwrap()
    }

    #[test]
    fn write_then_read_round_trips() {
        let fs = tfs(256);
        let ino = new_inode(&fs, 0);
        assert_eq!(ino.write_at(&fs, b"inode bytes", 0), 11);
        assert_eq!(ino.length(), 11);
        let mut buf = [0; 11];
        assert_eq!(ino.read_at(&fs, &mut buf, 0), 11);
        assert_eq!(&buf, b"inode bytes");
        fs.itable().close(&fs, ino);
    }

    #[test]
    fn reads_truncate_at_eof() {
        let fs = tfs(256);
        let ino = new_inode(&fs, 0);
        assert_eq!(ino.write_at(&fs, b"short", 0), 5);
        let mut buf = [0; 32];
        assert_eq!(ino.read_at(&fs, &mut buf, 0), 5);
        assert_eq!(ino.read_at(&fs, &mut buf, 5), 0);
        assert_eq!(ino.read_at(&fs, &mut buf, 1000), 0);
        fs.itable().close(&fs, ino);
    }

    #[test]
    fn open_returns_the_canonical_inode() {
        let fs = tfs(256);
        let a = new_inode(&fs, 0);
        let b = fs.itable().open(&fs, a.sector).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.open_cnt(), 2);

        fs.itable().close(&fs, b);
        assert_eq!(a.open_cnt(), 1);
        assert_eq!(fs.itable().len(), 1);
        fs.itable().close(&fs, a);
        assert!(fs.itable().is_empty());
    }

    #[test]
    fn growth_failure_releases_everything_it_allocated() {
        // 16 sectors: 8 for the fresh file system, 2 for this inode,
        // leaving 6. Growing by ten data sectors must fail and leave
        // the allocation count untouched.
        let fs = tfs(16);
        let ino = new_inode(&fs, 0);
        let before = fs.freemap().count_allocated();

        let big = [7u8; 10 * BSIZE];
        assert_eq!(ino.write_at(&fs, &big, 0), 0);
        assert_eq!(ino.length(), 0);
        assert_eq!(fs.freemap().count_allocated(), before);
        fs.itable().close(&fs, ino);
    }

    #[test]
    fn removed_inode_frees_blocks_on_final_close() {
        let fs = tfs(256);
        let ino = new_inode(&fs, 0);
        assert_eq!(ino.write_at(&fs, &[1; 2 * BSIZE], 0), 2 * BSIZE);
        let sector = ino.sector;
        let during = fs.freemap().count_allocated();

        ino.mark_removed();
        fs.itable().close(&fs, ino);
        // inode + doubly + indirect + two leaves came back.
        assert_eq!(fs.freemap().count_allocated(), during - 5);
        assert!(!fs.freemap().is_allocated(sector));
    }

    #[test]
    fn deny_write_gates_write_at() {
        let fs = tfs(256);
        let ino = new_inode(&fs, 0);
        ino.deny_write();
        assert_eq!(ino.deny_write_cnt(), 1);
        assert_eq!(ino.write_at(&fs, b"blocked", 0), 0);
        ino.allow_write();
        assert_eq!(ino.write_at(&fs, b"allowed", 0), 7);
        fs.itable().close(&fs, ino);
    }
}
