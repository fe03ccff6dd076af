//! Buffer cache.
//!
//! The buffer cache is a bounded set of buffers holding cached copies of
//! disk sector contents. Caching sectors in memory reduces the number of
//! disk reads and also provides a synchronization point for sectors used
//! by multiple processes.
//!
//! Interface:
//! * To copy bytes out of a sector, call `read`.
//! * To copy bytes into a sector, call `write`; the buffer is marked
//!   dirty and written back later.
//! * `flush` writes every dirty buffer to the device; a platform task is
//!   expected to call it every `FLUSH_INTERVAL` ticks and once more at
//!   shutdown.
//!
//! The cache holds at most `NBUF` entries in insertion order. When full,
//! the oldest entry is evicted (written back first if dirty) and its
//! slot repurposed for the new sector: FIFO, no second chance.
//!
//! Locking discipline: the cache lock guards the lookup list; each entry
//! carries a sleep lock guarding its bytes. Find-or-load *and* the
//! per-entry acquire both happen under the cache lock, so an entry can
//! never be repurposed between lookup and acquire. The cache lock is
//! released before the byte copy so long copies do not serialize the
//! whole cache.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use crate::hal::BlockDevice;
use crate::lock::{SleepLock, SpinLock};
use crate::param::{BSIZE, NBUF};

/// Contents of one cached sector.
pub struct BufData {
    /// Does the buffer differ from the on-disk sector?
    dirty: bool,

    data: [u8; BSIZE],
}

impl BufData {
    const fn new() -> Self {
        Self {
            dirty: false,
            data: [0; BSIZE],
        }
    }
}

/// A cache entry. The sector index it currently holds lives in the
/// lookup list, owned by the cache lock; the bytes live behind the
/// per-entry sleep lock.
struct BufEntry {
    sector: u32,
    buf: Arc<SleepLock<BufData>>,
}

pub struct Bcache {
    dev: Arc<dyn BlockDevice>,

    /// Insertion-ordered lookup list; front is the eviction victim.
    entries: SpinLock<VecDeque<BufEntry>>,
}

impl Bcache {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        Self {
            dev,
            entries: SpinLock::new("bcache", VecDeque::with_capacity(NBUF)),
        }
    }

    /// Copies `dst.len()` bytes from `sector` at `offset` into `dst`.
    /// `offset + dst.len()` must not exceed the sector size.
    pub fn read(&self, sector: u32, offset: usize, dst: &mut [u8]) {
        assert!(offset + dst.len() <= BSIZE, "bcache: read past sector end");
        let mut cache = self.entries.lock();
        let buf = Self::find_or_load(&mut cache, &*self.dev, sector);
        let guard = buf.lock();
        drop(cache);
        dst.copy_from_slice(&guard.data[offset..offset + dst.len()]);
    }

    /// Copies `src` into `sector` at `offset` and marks the buffer dirty.
    pub fn write(&self, sector: u32, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= BSIZE, "bcache: write past sector end");
        let mut cache = self.entries.lock();
        let buf = Self::find_or_load(&mut cache, &*self.dev, sector);
        let mut guard = buf.lock();
        drop(cache);
        guard.data[offset..offset + src.len()].copy_from_slice(src);
        guard.dirty = true;
    }

    /// Fills `sector` with zeros without reading it from disk first.
    pub fn zero(&self, sector: u32) {
        let mut cache = self.entries.lock();
        let buf = Self::find_or_load(&mut cache, &*self.dev, sector);
        let mut guard = buf.lock();
        drop(cache);
        guard.data.fill(0);
        guard.dirty = true;
    }

    /// Writes every dirty buffer to the device and clears its dirty bit.
    pub fn flush(&self) {
        let cache = self.entries.lock();
        for entry in cache.iter() {
            let mut guard = entry.buf.lock();
            if guard.dirty {
                self.dev.write(entry.sector, &guard.data);
                guard.dirty = false;
            }
        }
    }

    /// Returns the buffer caching `sector`, loading or evicting as
    /// needed. Runs entirely under the cache lock; the caller acquires
    /// the returned entry's lock before releasing the cache lock, which
    /// is what makes repurposed entries unobservable.
    fn find_or_load(
        cache: &mut VecDeque<BufEntry>,
        dev: &dyn BlockDevice,
        sector: u32,
    ) -> Arc<SleepLock<BufData>> {
        if let Some(entry) = cache.iter().find(|e| e.sector == sector) {
            return Arc::clone(&entry.buf);
        }

        if cache.len() < NBUF {
            // Room left: load into a fresh entry at the tail.
            let mut data = BufData::new();
            dev.read(sector, &mut data.data);
            let buf = Arc::new(SleepLock::new("buffer", data));
            cache.push_back(BufEntry {
                sector,
                buf: Arc::clone(&buf),
            });
            return buf;
        }

        // Evict the oldest entry and repurpose it. Taking its lock waits
        // out any copy still in flight on the old identity.
        let victim = cache.pop_front().expect("bcache: empty at capacity");
        {
            let mut guard = victim.buf.lock();
            if guard.dirty {
                dev.write(victim.sector, &guard.data);
                guard.dirty = false;
            }
            dev.read(sector, &mut guard.data);
        }
        let buf = Arc::clone(&victim.buf);
        cache.push_back(BufEntry {
            sector,
            buf: victim.buf,
        });
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::MemDisk;

    fn bcache(nsectors: u32) -> (Arc<MemDisk>, Bcache) {
        let disk = Arc::new(MemDisk::new(nsectors));
        let cache = Bcache::new(disk.clone());
        (disk, cache)
    }

    #[test]
    fn read_returns_written_bytes() {
        let (_, cache) = bcache(8);
        cache.write(3, 100, b"hello");
        let mut buf = [0; 5];
        cache.read(3, 100, &mut buf);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn write_is_not_on_disk_until_flush() {
        let (disk, cache) = bcache(8);
        cache.write(2, 0, b"dirty");
        let mut raw = [0; BSIZE];
        disk.read(2, &mut raw);
        assert_eq!(&raw[..5], &[0; 5]);

        cache.flush();
        disk.read(2, &mut raw);
        assert_eq!(&raw[..5], b"dirty");
    }

    #[test]
    fn capacity_is_bounded_and_eviction_writes_back() {
        let (disk, cache) = bcache(NBUF as u32 + 8);
        cache.write(0, 0, b"victim");
        // Touch NBUF further sectors; sector 0 is the FIFO victim.
        for sector in 1..=NBUF as u32 {
            let mut b = [0; 1];
            cache.read(sector, 0, &mut b);
        }
        assert_eq!(cache.entries.lock().len(), NBUF);

        let mut raw = [0; BSIZE];
        disk.read(0, &mut raw);
        assert_eq!(&raw[..6], b"victim");
    }

    #[test]
    fn one_entry_per_sector() {
        let (_, cache) = bcache(8);
        for _ in 0..4 {
            let mut b = [0; 1];
            cache.read(5, 0, &mut b);
        }
        let entries = cache.entries.lock();
        assert_eq!(entries.iter().filter(|e| e.sector == 5).count(), 1);
    }

    #[test]
    fn reload_after_eviction_sees_disk_contents() {
        let (_, cache) = bcache(NBUF as u32 + 8);
        cache.write(1, 0, b"persist");
        for sector in 2..2 + NBUF as u32 {
            let mut b = [0; 1];
            cache.read(sector, 0, &mut b);
        }
        let mut buf = [0; 7];
        cache.read(1, 0, &mut buf);
        assert_eq!(&buf, b"persist");
    }
}
