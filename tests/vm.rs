//! Virtual-memory integration tests: stack growth, eviction to swap,
//! re-faulting executable pages from disk, mmap write-back, pinning,
//! and process-exit cleanup.

use std::sync::Arc;

use tv6_kernel::hal::{MemDisk, SoftMmu};
use tv6_kernel::kernel::Kernel;
use tv6_kernel::param::{PGSIZE, USER_TOP};
use tv6_kernel::proc::Proc;
use tv6_kernel::vm::LocKind;

const DISK_SECTORS: u32 = 8192;
const SWAP_SECTORS: u32 = 512;

fn boot(user_pages: usize) -> (Arc<Kernel>, Arc<Proc>) {
    let disk = Arc::new(MemDisk::new(DISK_SECTORS));
    let swap = Arc::new(MemDisk::new(SWAP_SECTORS));
    let kernel = Arc::new(Kernel::new(disk, swap, user_pages, true).expect("boot"));
    let proc = kernel.spawn(Arc::new(SoftMmu::new())).expect("spawn");
    (kernel, proc)
}

/// A stack address `n` pages below the top of user space.
fn stack_page(n: usize) -> usize {
    USER_TOP - (n + 1) * PGSIZE
}

/// Faults fresh stack pages until `page`'s location leaves memory.
fn evict(k: &Kernel, p: &Arc<Proc>, victim: usize, mut scratch: usize) -> usize {
    let esp = USER_TOP - 256 * PGSIZE;
    let target = p.spt.find(victim).expect("victim tracked");
    for _ in 0..64 {
        if target.loc_kind() != LocKind::Memory {
            return scratch;
        }
        k.vm
            .handle_fault(&k.fs, p, stack_page(scratch), esp)
            .expect("scratch fault");
        scratch += 1;
    }
    panic!("victim was never evicted");
}

#[test]
fn stack_growth_materializes_a_writable_page() {
    let (k, p) = boot(4);
    let esp = USER_TOP - 2 * PGSIZE;

    // Exactly at esp.
    assert!(k.vm.handle_fault(&k.fs, &p, esp, esp).is_ok());
    // Within the 32-byte slop below esp.
    assert!(k.vm.handle_fault(&k.fs, &p, esp - 32, esp).is_ok());
    // Far below esp: not a stack access.
    assert!(k.vm.handle_fault(&k.fs, &p, esp - PGSIZE * 8, esp).is_err());
    // Below the stack region entirely.
    assert!(k.vm.handle_fault(&k.fs, &p, 0x1000, esp).is_err());
    // Kernel addresses never fault in.
    assert!(k.vm.handle_fault(&k.fs, &p, USER_TOP + 16, esp).is_err());

    let page = p.spt.find(esp).expect("stack page tracked");
    assert!(page.writable);
    assert_eq!(page.loc_kind(), LocKind::Memory);

    // A second fault on a resident page is a no-op.
    assert!(k.vm.handle_fault(&k.fs, &p, esp, esp).is_ok());
    p.exit(&k.fs, &k.vm);
}

#[test]
fn evicted_anonymous_page_round_trips_through_swap() {
    let (k, p) = boot(2);
    let esp = USER_TOP - 256 * PGSIZE;

    let victim = stack_page(0);
    k.vm.handle_fault(&k.fs, &p, victim, esp).unwrap();
    let pattern: Vec<u8> = (0..PGSIZE).map(|i| (i % 199) as u8).collect();
    k.vm.copy_out(&k.fs, &p, victim, &pattern).unwrap();

    let _ = evict(&k, &p, victim, 1);
    let page = p.spt.find(victim).unwrap();
    assert_eq!(page.loc_kind(), LocKind::Swap);
    assert!(k.vm.swap().used_slots() > 0);

    // Touching the page pulls it back byte-for-byte and frees its
    // slot. (The swap-in itself pushes some other anonymous page out,
    // so the slot count stays level rather than dropping.)
    let slots_before = k.vm.swap().used_slots();
    let mut back = vec![0u8; PGSIZE];
    k.vm.copy_in(&k.fs, &p, victim, &mut back).unwrap();
    assert_eq!(back, pattern);
    assert_eq!(page.loc_kind(), LocKind::Memory);
    assert_eq!(k.vm.swap().used_slots(), slots_before);
    p.exit(&k.fs, &k.vm);
}

#[test]
fn clean_executable_page_is_refetched_from_the_file() {
    let (k, p) = boot(2);
    let content: Vec<u8> = (0..3000).map(|i| (i % 233) as u8).collect();
    assert!(k.fs.create(&p, "/prog", 0).is_ok());
    let exec = k.fs.open(&p, "/prog").unwrap();
    assert_eq!(exec.write(&k.fs, &content), 3000);
    p.set_executable(exec.clone());

    let seg = 0x0800_0000;
    k.vm
        .map_segment(&p, &exec, 0, seg, 3000, PGSIZE - 3000, false)
        .unwrap();
    let page = p.spt.find(seg).unwrap();
    assert_eq!(page.loc_kind(), LocKind::InFile);

    // First touch loads the file bytes and zero-fills the tail.
    let mut buf = vec![0u8; PGSIZE];
    k.vm.copy_in(&k.fs, &p, seg, &mut buf).unwrap();
    assert_eq!(&buf[..3000], &content[..]);
    assert!(buf[3000..].iter().all(|&b| b == 0));

    // A clean executable page is discarded, not swapped: its location
    // goes back to the file. (Scratch stack pages evicted along the
    // way do land in swap.)
    let _ = evict(&k, &p, seg, 0);
    assert_eq!(page.loc_kind(), LocKind::InFile);

    // Refault: same bytes come back from the file.
    let mut again = vec![0u8; PGSIZE];
    k.vm.copy_in(&k.fs, &p, seg, &mut again).unwrap();
    assert_eq!(again, buf);

    // Executable pages are read-only to user copies.
    assert!(k.vm.copy_out(&k.fs, &p, seg, b"nope").is_err());
    p.exit(&k.fs, &k.vm);
}

#[test]
fn mmap_writes_reach_the_file_after_munmap() {
    let (k, p) = boot(4);
    assert!(k.fs.create(&p, "/m", 2 * PGSIZE as u32).is_ok());
    let fd = p.open_fd(&k.fs, "/m").unwrap();
    let file = p.file(fd).unwrap();

    let addr = 0x0900_0000;
    let id = k.vm.mmap(&k.fs, &p, &file, addr).expect("mmap");
    // The mapping holds its own handle; the descriptor may go away.
    p.close_fd(&k.fs, fd).unwrap();

    let mutation: Vec<u8> = (0..PGSIZE).map(|i| (i % 177) as u8).collect();
    k.vm.copy_out(&k.fs, &p, addr, &mutation).unwrap();
    k.vm.munmap(&k.fs, &p, id).expect("munmap");

    let check = k.fs.open(&p, "/m").unwrap();
    assert_eq!(check.len(&k.fs), 2 * PGSIZE as u32);
    let mut buf = vec![0u8; PGSIZE];
    assert_eq!(check.read_at(&k.fs, &mut buf, 0), PGSIZE);
    assert_eq!(buf, mutation);
    // The untouched second page is still zeros.
    assert_eq!(check.read_at(&k.fs, &mut buf, PGSIZE as u32), PGSIZE);
    assert!(buf.iter().all(|&b| b == 0));
    check.close(&k.fs);
    p.exit(&k.fs, &k.vm);
}

#[test]
fn mmap_reads_see_existing_file_contents() {
    let (k, p) = boot(4);
    assert!(k.fs.create(&p, "/data", 0).is_ok());
    let file = k.fs.open(&p, "/data").unwrap();
    assert_eq!(file.write(&k.fs, b"window into a file"), 18);

    let addr = 0x0a00_0000;
    let id = k.vm.mmap(&k.fs, &p, &file, addr).unwrap();
    let mut buf = [0u8; 18];
    k.vm.copy_in(&k.fs, &p, addr, &mut buf).unwrap();
    assert_eq!(&buf, b"window into a file");

    // Clean pages are not written back; the length never changes.
    k.vm.munmap(&k.fs, &p, id).unwrap();
    assert_eq!(file.len(&k.fs), 18);
    file.close(&k.fs);
    p.exit(&k.fs, &k.vm);
}

#[test]
fn mmap_rejects_bad_ranges() {
    let (k, p) = boot(4);
    assert!(k.fs.create(&p, "/f", PGSIZE as u32).is_ok());
    assert!(k.fs.create(&p, "/empty", 0).is_ok());
    let file = k.fs.open(&p, "/f").unwrap();
    let empty = k.fs.open(&p, "/empty").unwrap();

    // Unaligned, null, overlapping and empty mappings all fail.
    assert!(k.vm.mmap(&k.fs, &p, &file, 0x0900_0100).is_err());
    assert!(k.vm.mmap(&k.fs, &p, &file, 0).is_err());
    assert!(k.vm.mmap(&k.fs, &p, &empty, 0x0900_0000).is_err());
    let id = k.vm.mmap(&k.fs, &p, &file, 0x0900_0000).unwrap();
    assert!(k.vm.mmap(&k.fs, &p, &file, 0x0900_0000).is_err());

    k.vm.munmap(&k.fs, &p, id).unwrap();
    assert!(k.vm.munmap(&k.fs, &p, id).is_err());
    file.close(&k.fs);
    empty.close(&k.fs);
    p.exit(&k.fs, &k.vm);
}

#[test]
fn pinned_pages_are_not_evicted() {
    let (k, p) = boot(2);
    let esp = USER_TOP - 256 * PGSIZE;

    let pinned = stack_page(0);
    k.vm.handle_fault(&k.fs, &p, pinned, esp).unwrap();
    k.vm.pin_range(&k.fs, &p, pinned, PGSIZE).unwrap();

    // Plenty of eviction pressure; the pinned page must stay resident.
    for n in 1..6 {
        k.vm.handle_fault(&k.fs, &p, stack_page(n), esp).unwrap();
    }
    let page = p.spt.find(pinned).unwrap();
    assert_eq!(page.loc_kind(), LocKind::Memory);

    // Once unpinned it becomes evictable again.
    k.vm.unpin_range(&p, pinned, PGSIZE);
    let _ = evict(&k, &p, pinned, 6);
    assert_eq!(page.loc_kind(), LocKind::Swap);
    p.exit(&k.fs, &k.vm);
}

#[test]
fn exit_releases_frames_swap_and_files() {
    let (k, p) = boot(2);
    let esp = USER_TOP - 256 * PGSIZE;

    // A resident page, a swapped page, an mmap and an open fd.
    for n in 0..4 {
        k.vm.handle_fault(&k.fs, &p, stack_page(n), esp).unwrap();
    }
    assert!(k.vm.swap().used_slots() > 0 || k.vm.frames().len() == 2);

    assert!(k.fs.create(&p, "/m", PGSIZE as u32).is_ok());
    let fd = p.open_fd(&k.fs, "/m").unwrap();
    let file = p.file(fd).unwrap();
    let id = k.vm.mmap(&k.fs, &p, &file, 0x0900_0000).unwrap();
    k.vm.copy_out(&k.fs, &p, 0x0900_0000, b"flushed at exit").unwrap();
    drop(file);
    let _ = id;

    p.exit(&k.fs, &k.vm);
    assert_eq!(k.vm.frames().len(), 0);
    assert_eq!(k.vm.swap().used_slots(), 0);
    assert!(p.spt.is_empty());
    assert!(p.mmaps.is_empty());
    // Only zombie-free state remains: nothing open in the itable.
    assert_eq!(k.fs.itable().len(), 0);

    // The dirty mmap page was written back on exit.
    let p2 = k.spawn(Arc::new(SoftMmu::new())).unwrap();
    let check = k.fs.open(&p2, "/m").unwrap();
    let mut buf = [0u8; 15];
    assert_eq!(check.read_at(&k.fs, &mut buf, 0), 15);
    assert_eq!(&buf, b"flushed at exit");
    check.close(&k.fs);
}

#[test]
fn eviction_fills_the_pool_before_recycling() {
    let (k, p) = boot(3);
    let esp = USER_TOP - 256 * PGSIZE;
    for n in 0..3 {
        k.vm.handle_fault(&k.fs, &p, stack_page(n), esp).unwrap();
    }
    assert_eq!(k.vm.frames().len(), 3);

    // Further faults recycle frames instead of growing the pool.
    for n in 3..8 {
        k.vm.handle_fault(&k.fs, &p, stack_page(n), esp).unwrap();
        assert_eq!(k.vm.frames().len(), 3);
    }
    p.exit(&k.fs, &k.vm);
}
