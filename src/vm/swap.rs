//! Swap area.
//!
//! Swap slots each span `SECTORS_PER_PAGE` contiguous sectors on a
//! dedicated swap device; slot `i` covers sectors `8*i..8*i+8`. An
//! in-memory bitmap tracks allocation. Running out of swap is fatal.
//!
//! Slot I/O goes straight to the device: swap contents are transient
//! and never shared, so the buffer cache would only add copies.

use alloc::sync::Arc;
use core::convert::TryInto;

use bitmaps::Bitmap;

use crate::hal::BlockDevice;
use crate::lock::SpinLock;
use crate::param::{BSIZE, NSWAP, PGSIZE, SECTORS_PER_PAGE};

/// An allocated swap slot, identified by its first sector.
pub struct SwapSlot {
    base: u32,
}

impl SwapSlot {
    pub fn base(&self) -> u32 {
        self.base
    }

    fn index(&self) -> usize {
        self.base as usize / SECTORS_PER_PAGE
    }
}

pub struct SwapTable {
    dev: Arc<dyn BlockDevice>,
    used: SpinLock<Bitmap<NSWAP>>,

    /// Slots actually backed by the device; at most `NSWAP`.
    nslots: usize,
}

impl SwapTable {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        let nslots = (dev.size() as usize / SECTORS_PER_PAGE).min(NSWAP);
        Self {
            dev,
            used: SpinLock::new("swap bitmap", Bitmap::new()),
            nslots,
        }
    }

    /// Claims the first free slot. Swap exhaustion is fatal.
    pub fn allocate(&self) -> SwapSlot {
        let mut used = self.used.lock();
        let idx = match used.first_false_index() {
            Some(idx) if idx < self.nslots => idx,
            _ => panic!("swap: out of slots"),
        };
        let _ = used.set(idx, true);
        SwapSlot {
            base: (idx * SECTORS_PER_PAGE) as u32,
        }
    }

    /// Returns `slot` to the pool.
    pub fn free(&self, slot: SwapSlot) {
        let mut used = self.used.lock();
        let was = used.set(slot.index(), false);
        assert!(was, "swap: freeing free slot");
    }

    /// Writes a page into `slot`'s sectors.
    pub fn write_slot(&self, slot: &SwapSlot, data: &[u8; PGSIZE]) {
        for i in 0..SECTORS_PER_PAGE {
            let sector: &[u8; BSIZE] = data[i * BSIZE..(i + 1) * BSIZE]
                .try_into()
                .expect("swap: sector slice");
            self.dev.write(slot.base + i as u32, sector);
        }
    }

    /// Reads `slot`'s sectors into a page.
    pub fn read_slot(&self, slot: &SwapSlot, data: &mut [u8; PGSIZE]) {
        for i in 0..SECTORS_PER_PAGE {
            let mut sector = [0; BSIZE];
            self.dev.read(slot.base + i as u32, &mut sector);
            data[i * BSIZE..(i + 1) * BSIZE].copy_from_slice(&sector);
        }
    }

    /// Number of slots currently allocated.
    pub fn used_slots(&self) -> usize {
        self.used.lock().len()
    }
}
