//! Directories.
//!
//! A directory is a file whose content is a sequence of fixed-size
//! `Dirent` structures. Entries are searched linearly; an addition
//! reuses the first free slot and appends only when none is free. The
//! `.` and `..` names are not stored: the resolver synthesizes them from
//! the parent sector recorded in every directory inode.

use alloc::sync::Arc;
use core::mem;

use arrayvec::ArrayString;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use super::inode::Inode;
use super::Tfs;

/// Maximum length of a file name component.
pub const DIRSIZ: usize = 14;

/// Number of entries a fresh directory has room for before it grows.
pub const DIR_INIT_ENTRIES: u32 = 16;

/// On-disk directory entry.
#[repr(C)]
#[derive(Clone, Copy, Default, AsBytes, FromBytes)]
pub struct Dirent {
    in_use: u8,
    _pad: u8,
    name: [u8; DIRSIZ],

    /// Inode sector of the named file or directory.
    sector: u32,
}

pub const DIRENT_SIZE: usize = mem::size_of::<Dirent>();
const_assert!(DIRENT_SIZE == 20);

impl Dirent {
    /// Fills in the name. If shorter than `DIRSIZ`, a NUL terminator is
    /// appended.
    fn set_name(&mut self, name: &str) {
        let name = name.as_bytes();
        self.name = [0; DIRSIZ];
        self.name[..name.len()].copy_from_slice(name);
    }

    fn name_matches(&self, name: &str) -> bool {
        let name = name.as_bytes();
        if name.len() > DIRSIZ {
            return false;
        }
        let stored_len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(DIRSIZ);
        &self.name[..stored_len] == name
    }

    fn name(&self) -> ArrayString<DIRSIZ> {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(DIRSIZ);
        let mut out = ArrayString::new();
        if let Ok(s) = core::str::from_utf8(&self.name[..len]) {
            let _ = out.try_push_str(s);
        }
        out
    }
}

/// An open directory, wrapping the underlying inode.
pub struct Dir {
    inode: Arc<Inode>,
}

impl Dir {
    /// Writes a fresh directory inode to `sector` with room for
    /// `DIR_INIT_ENTRIES` entries, recording `parent` as its parent.
    pub fn create(fs: &Tfs, sector: u32, parent: u32) -> Result<(), ()> {
        Inode::create(
            fs,
            sector,
            DIR_INIT_ENTRIES * DIRENT_SIZE as u32,
            true,
            parent,
        )
    }

    /// Opens a directory over `inode`. Fails if it is not a directory.
    pub fn open(inode: Arc<Inode>) -> Result<Dir, Arc<Inode>> {
        if inode.is_dir() {
            Ok(Dir { inode })
        } else {
            Err(inode)
        }
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// Consumes the handle and drops its reference to the inode.
    pub fn close(self, fs: &Tfs) {
        fs.itable().close(fs, self.inode);
    }

    /// Reads the `idx`th entry, in use or not. `None` past the end.
    fn entry(&self, fs: &Tfs, idx: u32) -> Option<Dirent> {
        read_entry(fs, &self.inode, idx)
    }

    fn write_entry(&self, fs: &Tfs, idx: u32, de: &Dirent) -> Result<(), ()> {
        let off = idx * DIRENT_SIZE as u32;
        if self.inode.write_at(fs, de.as_bytes(), off) != DIRENT_SIZE {
            return Err(());
        }
        Ok(())
    }

    /// Looks up `name`; returns the inode sector it names.
    pub fn lookup(&self, fs: &Tfs, name: &str) -> Result<u32, ()> {
        self.find(fs, name).map(|(_, de)| de.sector)
    }

    fn find(&self, fs: &Tfs, name: &str) -> Result<(u32, Dirent), ()> {
        let mut idx = 0;
        while let Some(de) = self.entry(fs, idx) {
            if de.in_use != 0 && de.name_matches(name) {
                return Ok((idx, de));
            }
            idx += 1;
        }
        Err(())
    }

    /// Adds an entry mapping `name` to `sector`. Fails on a duplicate
    /// name, an empty or over-long name, or when the directory cannot
    /// grow.
    pub fn add(&self, fs: &Tfs, name: &str, sector: u32) -> Result<(), ()> {
        if name.is_empty() || name.len() > DIRSIZ {
            return Err(());
        }
        if self.find(fs, name).is_ok() {
            return Err(());
        }

        // First free slot, or one past the end.
        let mut idx = 0;
        while let Some(de) = self.entry(fs, idx) {
            if de.in_use == 0 {
                break;
            }
            idx += 1;
        }

        let mut de = Dirent::default();
        de.in_use = 1;
        de.set_name(name);
        de.sector = sector;
        self.write_entry(fs, idx, &de)
    }

    /// Removes the entry for `name`, marking the named inode for block
    /// release on its final close. Refuses to remove a directory unless
    /// `dirs_ok` is set and the directory has no in-use entries.
    pub fn remove(&self, fs: &Tfs, name: &str, dirs_ok: bool) -> Result<(), ()> {
        let (idx, de) = self.find(fs, name)?;
        let inode = fs.itable().open(fs, de.sector)?;

        if inode.is_dir() && !(dirs_ok && entries_all_free(fs, &inode)) {
            fs.itable().close(fs, inode);
            return Err(());
        }

        inode.mark_removed();
        fs.itable().close(fs, inode);

        let mut de = de;
        de.in_use = 0;
        self.write_entry(fs, idx, &de)
    }

    /// Whether the directory holds no in-use entries.
    pub fn is_empty(&self, fs: &Tfs) -> bool {
        entries_all_free(fs, &self.inode)
    }

    /// Returns the name of the next in-use entry at or after `*cursor`,
    /// advancing the cursor past it. `None` when the directory is
    /// exhausted.
    pub fn readdir(&self, fs: &Tfs, cursor: &mut u32) -> Option<ArrayString<DIRSIZ>> {
        while let Some(de) = self.entry(fs, *cursor) {
            *cursor += 1;
            if de.in_use != 0 {
                return Some(de.name());
            }
        }
        None
    }
}

fn read_entry(fs: &Tfs, inode: &Inode, idx: u32) -> Option<Dirent> {
    let mut de = Dirent::default();
    let off = idx * DIRENT_SIZE as u32;
    if inode.read_at(fs, de.as_bytes_mut(), off) != DIRENT_SIZE {
        return None;
    }
    Some(de)
}

fn entries_all_free(fs: &Tfs, inode: &Inode) -> bool {
    let mut idx = 0;
    while let Some(de) = read_entry(fs, inode, idx) {
        if de.in_use != 0 {
            return false;
        }
        idx += 1;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::ROOT_DIR_SECTOR;
    use crate::hal::MemDisk;

    fn new_dir() -> (Tfs, Dir) {
        let fs = Tfs::mount(Arc::new(MemDisk::new(512)), true).expect("mount");
        let sector = fs.freemap().allocate(1).unwrap();
        Dir::create(&fs, sector, ROOT_DIR_SECTOR).unwrap();
        let inode = fs.itable().open(&fs, sector).unwrap();
        let dir = Dir::open(inode).ok().unwrap();
        (fs, dir)
    }

    #[test]
    fn add_lookup_remove() {
        let (fs, dir) = new_dir();
        assert!(dir.is_empty(&fs));
        assert!(dir.add(&fs, "notes", 99).is_ok());
        assert_eq!(dir.lookup(&fs, "notes"), Ok(99));
        assert!(dir.lookup(&fs, "nope").is_err());

        // The removed entry's inode sector is torn down lazily, so use
        // a real inode here.
        let target = fs.freemap().allocate(1).unwrap();
        Inode::create(&fs, target, 0, false, dir.inode().sector).unwrap();
        assert!(dir.add(&fs, "real", target).is_ok());
        assert!(dir.remove(&fs, "real", true).is_ok());
        assert!(dir.lookup(&fs, "real").is_err());
        dir.close(&fs);
    }

    #[test]
    fn duplicates_and_bad_names_are_rejected() {
        let (fs, dir) = new_dir();
        assert!(dir.add(&fs, "twice", 7).is_ok());
        assert!(dir.add(&fs, "twice", 8).is_err());
        assert!(dir.add(&fs, "", 9).is_err());
        assert!(dir.add(&fs, "much-too-long-name", 10).is_err());
        dir.close(&fs);
    }

    #[test]
    fn add_reuses_freed_slots_and_grows_past_capacity() {
        let (fs, dir) = new_dir();
        let target = fs.freemap().allocate(1).unwrap();
        Inode::create(&fs, target, 0, false, dir.inode().sector).unwrap();
        assert!(dir.add(&fs, "hole", target).is_ok());
        assert!(dir.add(&fs, "keep", 50).is_ok());
        assert!(dir.remove(&fs, "hole", true).is_ok());

        // The freed slot 0 is reused before the tail.
        assert!(dir.add(&fs, "fill", 51).is_ok());
        let mut cursor = 0;
        assert_eq!(dir.readdir(&fs, &mut cursor).unwrap().as_str(), "fill");

        // Past the initial 16 entries the directory file grows.
        let before = dir.inode().length();
        for i in 0..DIR_INIT_ENTRIES {
            let name = format!("f{}", i);
            assert!(dir.add(&fs, &name, 100 + i).is_ok());
        }
        assert!(dir.inode().length() > before);
        dir.close(&fs);
    }

    #[test]
    fn readdir_skips_free_slots() {
        let (fs, dir) = new_dir();
        let target = fs.freemap().allocate(1).unwrap();
        Inode::create(&fs, target, 0, false, dir.inode().sector).unwrap();
        assert!(dir.add(&fs, "a", target).is_ok());
        assert!(dir.add(&fs, "b", 61).is_ok());
        assert!(dir.add(&fs, "c", 62).is_ok());
        assert!(dir.remove(&fs, "a", true).is_ok());

        let mut cursor = 0;
        let mut names = Vec::new();
        while let Some(name) = dir.readdir(&fs, &mut cursor) {
            names.push(name);
        }
        assert_eq!(names.len(), 2);
        assert_eq!(names[0].as_str(), "b");
        assert_eq!(names[1].as_str(), "c");
        dir.close(&fs);
    }
}
