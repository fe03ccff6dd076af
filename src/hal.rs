//! Hardware abstraction layer.
//!
//! The core manages durable structures and physical frames but does not
//! talk to hardware itself. Everything it needs from the machine comes
//! through two traits:
//!
//! * [`BlockDevice`]: an opaque disk exposing fixed-size sector
//!   read/write. One instance backs the file system, another the swap
//!   area.
//! * [`Mmu`]: the per-process page-table hardware interface: install and
//!   remove virtual-to-physical mappings and read/write the accessed and
//!   dirty bits of a mapping.
//!
//! [`MemDisk`] and [`SoftMmu`] are in-memory reference implementations.
//! They stand in for the device driver and the paging hardware when the
//! core runs hosted (and under the test suite).

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

use crate::lock::SpinLock;
use crate::param::BSIZE;

/// A block device: an array of `BSIZE`-byte sectors.
///
/// Device I/O is assumed infallible at this layer.
pub trait BlockDevice: Send + Sync {
    /// Number of sectors on the device.
    fn size(&self) -> u32;

    /// Reads sector `sector` into `buf`.
    fn read(&self, sector: u32, buf: &mut [u8; BSIZE]);

    /// Writes `buf` to sector `sector`.
    fn write(&self, sector: u32, buf: &[u8; BSIZE]);
}

/// Per-process page-table hardware interface.
///
/// `pa` is the base address of the physical frame backing the mapping.
/// A hardware MMU maintains the accessed/dirty bits itself; a software
/// implementation relies on [`Mmu::mark_access`] being called on every
/// simulated user-mode access.
pub trait Mmu: Send + Sync {
    /// Installs a mapping from the page at `va` to the frame at `pa`.
    /// Replaces any existing mapping for `va`.
    fn map(&self, va: usize, pa: usize, writable: bool);

    /// Removes the mapping for the page at `va`, if any.
    fn unmap(&self, va: usize);

    /// Returns whether `va` is mapped.
    fn is_mapped(&self, va: usize) -> bool;

    fn is_accessed(&self, va: usize) -> bool;
    fn clear_accessed(&self, va: usize);
    fn is_dirty(&self, va: usize) -> bool;
    fn clear_dirty(&self, va: usize);

    /// Records a user-mode access to `va`, setting the accessed bit and,
    /// for writes, the dirty bit. Hardware does this implicitly.
    fn mark_access(&self, va: usize, write: bool);
}

/// An in-memory block device.
pub struct MemDisk {
    sectors: SpinLock<Vec<[u8; BSIZE]>>,
}

impl MemDisk {
    /// Returns a zero-filled disk with `size` sectors.
    pub fn new(size: u32) -> Self {
        Self {
            sectors: SpinLock::new("memdisk", vec![[0; BSIZE]; size as usize]),
        }
    }
}

impl BlockDevice for MemDisk {
    fn size(&self) -> u32 {
        self.sectors.lock().len() as u32
    }

    fn read(&self, sector: u32, buf: &mut [u8; BSIZE]) {
        *buf = self.sectors.lock()[sector as usize];
    }

    fn write(&self, sector: u32, buf: &[u8; BSIZE]) {
        self.sectors.lock()[sector as usize] = *buf;
    }
}

#[derive(Clone, Copy)]
struct Mapping {
    pa: usize,
    writable: bool,
    accessed: bool,
    dirty: bool,
}

/// A software page table, keyed by page-aligned virtual address.
pub struct SoftMmu {
    map: SpinLock<BTreeMap<usize, Mapping>>,
}

impl SoftMmu {
    pub fn new() -> Self {
        Self {
            map: SpinLock::new("softmmu", BTreeMap::new()),
        }
    }

    /// Returns the frame base `va` maps to, if mapped.
    pub fn translate(&self, va: usize) -> Option<usize> {
        self.map.lock().get(&va).map(|m| m.pa)
    }
}

impl Default for SoftMmu {
    fn default() -> Self {
        Self::new()
    }
}

impl Mmu for SoftMmu {
    fn map(&self, va: usize, pa: usize, writable: bool) {
        let _ = self.map.lock().insert(
            va,
            Mapping {
                pa,
                writable,
                accessed: false,
                dirty: false,
            },
        );
    }

    fn unmap(&self, va: usize) {
        let _ = self.map.lock().remove(&va);
    }

    fn is_mapped(&self, va: usize) -> bool {
        self.map.lock().contains_key(&va)
    }

    fn is_accessed(&self, va: usize) -> bool {
        self.map.lock().get(&va).map_or(false, |m| m.accessed)
    }

    fn clear_accessed(&self, va: usize) {
        if let Some(m) = self.map.lock().get_mut(&va) {
            m.accessed = false;
        }
    }

    fn is_dirty(&self, va: usize) -> bool {
        self.map.lock().get(&va).map_or(false, |m| m.dirty)
    }

    fn clear_dirty(&self, va: usize) {
        if let Some(m) = self.map.lock().get_mut(&va) {
            m.dirty = false;
        }
    }

    fn mark_access(&self, va: usize, write: bool) {
        if let Some(m) = self.map.lock().get_mut(&va) {
            m.accessed = true;
            if write {
                debug_assert!(m.writable, "softmmu: write to read-only mapping");
                m.dirty = true;
            }
        }
    }
}
