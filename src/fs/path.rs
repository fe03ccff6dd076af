//! Path resolution.
//!
//! Walks absolute paths from the root directory and relative paths from
//! the calling process's current directory. Components are split on
//! `/`; repeated and trailing slashes are ignored, so `/d/` names the
//! directory itself. `.` keeps the current directory and `..` follows
//! the parent sector recorded in the current inode (the root is its own
//! parent). An intermediate component that is not a directory is an
//! error.
//!
//! The resolver opens one directory handle per step and closes every
//! handle it takes before returning.

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::dir::Dir;
use super::inode::Inode;
use super::{Tfs, ROOT_DIR_SECTOR};
use crate::proc::Proc;

/// What to do with the path's last component.
pub enum Action {
    /// Every component must resolve; returns the terminal sector.
    Lookup,

    /// All but the last component must resolve; the last must not
    /// exist. A file inode of `size` zeroed bytes is created and added
    /// to the parent directory. Returns the new inode's sector.
    CreateFile { size: u32 },

    /// As `CreateFile`, but a directory is created with its parent
    /// pointer set to the enclosing directory.
    MakeDir,

    /// All but the last component must resolve; the last is removed
    /// from its parent directory.
    Remove,
}

impl Tfs {
    /// Resolves `path` and performs `action` on its last component.
    /// Returns the sector of the inode the action ended on.
    ///
    /// Caller must hold the file-system lock.
    pub(crate) fn resolve(&self, proc: &Proc, path: &str, action: Action) -> Result<u32, ()> {
        if path.is_empty() {
            return Err(());
        }
        let comps: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();

        let start = if path.starts_with('/') {
            ROOT_DIR_SECTOR
        } else {
            proc.cwd_sector().ok_or(())?
        };
        let mut cur = self.itable().open(self, start)?;

        if let Action::Lookup = action {
            for name in comps {
                cur = self.step(cur, name)?;
            }
            let sector = cur.sector;
            self.itable().close(self, cur);
            return Ok(sector);
        }

        // Create and remove act through the parent directory, so the
        // last component must be a real name.
        let (last, parents) = match comps.split_last() {
            Some(split) if *split.0 != "." && *split.0 != ".." => split,
            _ => {
                self.itable().close(self, cur);
                return Err(());
            }
        };
        for name in parents {
            cur = self.step(cur, name)?;
        }
        let parent = match Dir::open(cur) {
            Ok(d) => d,
            Err(inode) => {
                self.itable().close(self, inode);
                return Err(());
            }
        };

        let result = match action {
            Action::CreateFile { size } => self.create_in(&parent, last, size, false),
            Action::MakeDir => self.create_in(&parent, last, 0, true),
            Action::Remove => parent.remove(self, last, true).map(|()| 0),
            Action::Lookup => unreachable!(),
        };
        parent.close(self);
        result
    }

    /// One resolution step: from directory `cur` to component `name`.
    /// Consumes (and closes) `cur` in every case.
    fn step(&self, cur: Arc<Inode>, name: &str) -> Result<Arc<Inode>, ()> {
        if !cur.is_dir() {
            self.itable().close(self, cur);
            return Err(());
        }
        match name {
            "." => Ok(cur),
            ".." => {
                let parent = cur.parent();
                self.itable().close(self, cur);
                self.itable().open(self, parent)
            }
            _ => {
                let dir = match Dir::open(cur) {
                    Ok(dir) => dir,
                    Err(_) => unreachable!("resolve: checked is_dir"),
                };
                let found = dir.lookup(self, name);
                dir.close(self);
                self.itable().open(self, found?)
            }
        }
    }

    /// Allocates an inode sector, builds a file or directory inode on
    /// it, and links it into `parent` under `name`. Rolls everything
    /// back if any stage fails.
    fn create_in(&self, parent: &Dir, name: &str, size: u32, is_dir: bool) -> Result<u32, ()> {
        let sector = self.freemap().allocate(1)?;
        let parent_sector = parent.inode().sector;

        let built = if is_dir {
            Dir::create(self, sector, parent_sector)
        } else {
            Inode::create(self, sector, size, false, parent_sector)
        };
        if built.is_err() {
            self.freemap().release(sector, 1);
            return Err(());
        }

        if parent.add(self, name, sector).is_err() {
            // Unlink what we just built: open, mark, close releases the
            // blocks and the inode sector.
            if let Ok(inode) = self.itable().open(self, sector) {
                inode.mark_removed();
                self.itable().close(self, inode);
            }
            return Err(());
        }
        Ok(sector)
    }
}
