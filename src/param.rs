/// Size of a disk sector in bytes.
pub const BSIZE: usize = 512;

/// Size of the disk sector cache.
pub const NBUF: usize = 64;

/// Ticks between two runs of the periodic buffer-cache flush.
pub const FLUSH_INTERVAL: u64 = 10;

/// Open files per process. Descriptors 0 and 1 are the console.
pub const NOFILE: usize = 16;

/// Size of a page of physical or virtual memory.
pub const PGSIZE: usize = 4096;

/// Sectors backing one page; a swap slot spans exactly this many.
pub const SECTORS_PER_PAGE: usize = PGSIZE / BSIZE;

/// Maximum number of swap slots tracked by the swap table.
pub const NSWAP: usize = 1024;

/// First virtual address above user space.
pub const USER_TOP: usize = 0xc000_0000;

/// The stack may grow to at most this many bytes below `USER_TOP`.
pub const STACK_LIMIT: usize = 8 * 1024 * 1024;

/// A fault this far below the user stack pointer still counts as a
/// stack access (PUSHA writes 32 bytes below the stack pointer).
pub const STACK_SLOP: usize = 32;

/// Round `addr` down to the nearest page boundary.
pub const fn pg_round_down(addr: usize) -> usize {
    addr & !(PGSIZE - 1)
}

/// Round `addr` up to the nearest page boundary.
pub const fn pg_round_up(addr: usize) -> usize {
    (addr + PGSIZE - 1) & !(PGSIZE - 1)
}
