mod common;

use common::{KERNEL_VIRT, TestPhys, config, kernel_image, memory_map};
use kernel_alloc::{MemoryConfig, MemoryError, MemoryManager, PagePermissions};
use kernel_info::boot::{MemoryRegion, MemoryRegionKind};
use kernel_info::memory::{HHDM_BASE, KERNEL_HEAP_BASE};
use kernel_memory_addresses::PhysicalFrame;
use std::ptr::NonNull;
use std::thread;

const USER_VA: u64 = 0x4000_0000;

fn manager(phys: &TestPhys) -> MemoryManager<'_, TestPhys> {
    MemoryManager::init(&memory_map(), kernel_image(), phys, config()).expect("init")
}

#[test]
fn init_builds_bitmap_direct_map_and_heap() {
    let phys = TestPhys::new();
    let m = manager(&phys);
    let stats = m.stats();

    assert_eq!(stats.total_frames, 256);
    // 223 usable, minus the kernel image, the bitmap, 10 tables and 4 heap pages.
    assert_eq!(stats.free_frames, 200);
    assert_eq!(stats.page_tables, 10);
    assert_eq!(stats.heap_mapped, 0x4000);
    assert_eq!(stats.heap_used, 0);
    assert_eq!(stats.heap_blocks, 1);
    assert_eq!(m.bitmap_location().start, PhysicalFrame::from_number(1));
    assert_eq!(m.root_table(), PhysicalFrame::from_number(2));

    assert_eq!(m.translate(HHDM_BASE + 0x5123), Some(0x5123));
    assert_eq!(m.translate(HHDM_BASE + 0x4_2000), Some(0x4_2000));
    assert_eq!(m.translate(HHDM_BASE + 0x10_0000), None);
    assert_eq!(m.translate(KERNEL_VIRT + 0x7FF8), Some(0x5_7FF8));
    assert_eq!(m.translate(KERNEL_VIRT + 0x8000), None);
    assert!(m.translate(KERNEL_HEAP_BASE + 0x3FFF).is_some());
    assert_eq!(m.translate(KERNEL_HEAP_BASE + 0x4000), None);

    assert_eq!(m.phys_to_virt(0x1234), Some(HHDM_BASE + 0x1234));
    assert_eq!(m.phys_to_virt(0x10_0000), None);
    assert_eq!(m.virt_to_phys(HHDM_BASE + 0xF_F000), Some(0xF_F000));
    assert_eq!(m.virt_to_phys(KERNEL_HEAP_BASE), None);
}

#[test]
fn frames_come_lowest_first_and_skip_reserved_memory() {
    let phys = TestPhys::new();
    let m = manager(&phys);

    // Frames 0..16 hold frame 0, the bitmap, page tables and the heap.
    let first = m.allocate_frame().unwrap();
    assert_eq!(first, PhysicalFrame::from_number(16));
    m.free_frame(first).unwrap();
    assert_eq!(m.allocate_frame().unwrap(), first);

    assert_eq!(
        m.free_frame(PhysicalFrame::from_number(0x30)),
        Err(MemoryError::DoubleFree { address: 0x3_0000 })
    );
    assert_eq!(
        m.free_frame(PhysicalFrame::from_number(0x1000)),
        Err(MemoryError::OutOfRange { address: 0x100_0000 })
    );

    let run = m.allocate_contiguous(4).unwrap();
    assert_eq!(run, PhysicalFrame::from_number(17));
    m.free_contiguous(run, 4).unwrap();
    assert_eq!(
        m.free_contiguous(run, 4),
        Err(MemoryError::DoubleFree { address: 0x1_1000 })
    );
    assert!(matches!(m.allocate_contiguous(0), Err(MemoryError::InvalidArgument(_))));
    assert_eq!(m.allocate_contiguous(1000), Err(MemoryError::OutOfMemory));
}

#[test]
fn kalloc_and_kfree() {
    let phys = TestPhys::new();
    let m = manager(&phys);

    let a = m.kalloc(100).unwrap();
    let b = m.kalloc(0).unwrap();
    let va = a.as_ptr() as u64;
    assert!(va >= KERNEL_HEAP_BASE && va < KERNEL_HEAP_BASE + 0x4000);
    assert_eq!(va % 16, 0);
    assert_ne!(a, b);
    assert!(m.stats().heap_used >= 112);

    m.kfree(a).unwrap();
    assert_eq!(m.kfree(a), Err(MemoryError::DoubleFree { address: va }));
    let interior = NonNull::new((va + 16) as *mut u8).unwrap();
    assert_eq!(m.kfree(interior), Err(MemoryError::InvalidPointer { address: va + 16 }));
    let foreign = NonNull::new(0x1000 as *mut u8).unwrap();
    assert_eq!(m.kfree(foreign), Err(MemoryError::InvalidPointer { address: 0x1000 }));

    m.kfree(b).unwrap();
    let stats = m.stats();
    assert_eq!(stats.heap_used, 0);
    assert_eq!(stats.heap_blocks, 1);
}

#[test]
fn kalloc_aligned_honours_page_alignment() {
    let phys = TestPhys::new();
    let m = manager(&phys);

    let small = m.kalloc(100).unwrap();
    let page = m.kalloc_aligned(64, 4096).unwrap();
    let va = page.as_ptr() as u64;
    assert_eq!(va % 4096, 0);
    assert!(va > KERNEL_HEAP_BASE && va < KERNEL_HEAP_BASE + 0x1_0000);
    assert!(m.translate(va).is_some());
    // The leading pad stays free for ordinary requests.
    assert_eq!(m.stats().heap_blocks, 4);

    assert_eq!(m.kalloc_aligned(64, 24), None);
    assert_eq!(m.kalloc_aligned(64, 0x2_0000), None);

    m.kfree(page).unwrap();
    m.kfree(small).unwrap();
    let stats = m.stats();
    assert_eq!(stats.heap_used, 0);
    assert_eq!(stats.heap_blocks, 1);
}

#[test]
fn absurd_kalloc_sizes_fail_cleanly() {
    let phys = TestPhys::new();
    let m = manager(&phys);
    let filler = m.kalloc(0x4000 - 32).unwrap();
    let before = m.stats();

    for size in [usize::MAX, usize::MAX - 15, 0x1_0001] {
        assert_eq!(m.kalloc(size), None);
    }
    let after = m.stats();
    assert_eq!(after.heap_mapped, before.heap_mapped);
    assert_eq!(after.free_frames, before.free_frames);

    m.kfree(filler).unwrap();
    assert_eq!(m.stats().heap_used, 0);
}

#[test]
fn heap_grows_until_its_window_is_full() {
    let phys = TestPhys::new();
    let m = manager(&phys);
    let before = m.stats();

    let big = m.kalloc(0x6000).expect("heap grows");
    let grown = m.stats();
    assert!(grown.heap_mapped > before.heap_mapped);
    assert!(grown.heap_mapped <= 0x1_0000);
    assert!(grown.free_frames < before.free_frames);

    assert_eq!(m.kalloc(0x1_0000), None);
    m.kfree(big).unwrap();
    assert_eq!(m.stats().heap_used, 0);
}

#[test]
fn map_translate_unmap() {
    let phys = TestPhys::new();
    let m = manager(&phys);
    let free_before = m.stats().free_frames;
    let frame = m.allocate_frame().unwrap().start_address().as_u64();

    m.map_page(USER_VA, frame, PagePermissions::WRITABLE).unwrap();
    assert_eq!(m.translate(USER_VA + 0x123), Some(frame + 0x123));
    assert_eq!(
        m.map_page(USER_VA, frame, PagePermissions::WRITABLE),
        Err(MemoryError::AlreadyMapped { address: USER_VA })
    );

    let other = m.allocate_frame().unwrap().start_address().as_u64();
    assert_eq!(m.remap_page(USER_VA, other, PagePermissions::empty()), Ok(Some(frame)));
    assert_eq!(m.translate(USER_VA), Some(other));

    m.unmap_page(USER_VA).unwrap();
    assert_eq!(m.translate(USER_VA), None);
    assert_eq!(m.unmap_page(USER_VA), Err(MemoryError::Unmapped { address: USER_VA }));

    // Unmapping leaves the frames with the caller.
    m.free_frame(PhysicalFrame::from_number(frame / 4096)).unwrap();
    m.free_frame(PhysicalFrame::from_number(other / 4096)).unwrap();
    assert_eq!(m.stats().free_frames, free_before);
}

#[test]
fn map_page_rejects_bad_requests() {
    let phys = TestPhys::new();
    let m = manager(&phys);
    let frame = m.allocate_frame().unwrap().start_address().as_u64();
    let rw = PagePermissions::WRITABLE;

    assert_eq!(
        m.map_page(USER_VA + 1, frame, rw),
        Err(MemoryError::AlignmentViolation { address: USER_VA + 1 })
    );
    assert_eq!(
        m.map_page(USER_VA, frame + 8, rw),
        Err(MemoryError::AlignmentViolation { address: frame + 8 })
    );
    assert_eq!(
        m.map_page(0x0000_8000_0000_0000, frame, rw),
        Err(MemoryError::NonCanonical {
            address: 0x0000_8000_0000_0000
        })
    );
    assert_eq!(
        m.map_page(KERNEL_HEAP_BASE + 0x8000, frame, rw),
        Err(MemoryError::ReservedRange {
            address: KERNEL_HEAP_BASE + 0x8000
        })
    );
    assert_eq!(
        m.map_page(HHDM_BASE + 0x1000, frame, rw),
        Err(MemoryError::ReservedRange {
            address: HHDM_BASE + 0x1000
        })
    );
    assert_eq!(
        m.map_page(USER_VA, 0x2_0000, rw),
        Err(MemoryError::FrameNotAllocated { address: 0x2_0000 })
    );
    assert_eq!(m.translate(USER_VA), None);

    // Device memory outside the managed range needs no allocation.
    m.map_page(USER_VA, 0xFEE0_0000, rw | PagePermissions::CACHE_DISABLE)
        .unwrap();
    assert_eq!(m.translate(USER_VA + 0x30), Some(0xFEE0_0030));
}

#[test]
fn failed_mapping_returns_reserved_tables() {
    let phys = TestPhys::new();
    let m = manager(&phys);
    let mut held = Vec::new();
    while let Ok(frame) = m.allocate_frame() {
        held.push(frame);
    }
    let target = held.pop().unwrap().start_address().as_u64();
    let rw = PagePermissions::WRITABLE;

    // A fresh lower-half mapping needs three tables.
    for frame in held.drain(..2) {
        m.free_frame(frame).unwrap();
    }
    assert_eq!(m.map_page(USER_VA, target, rw), Err(MemoryError::OutOfMemory));
    assert_eq!(m.translate(USER_VA), None);
    assert_eq!(m.stats().free_frames, 2);

    m.free_frame(held.pop().unwrap()).unwrap();
    m.map_page(USER_VA, target, rw).unwrap();
    assert_eq!(m.translate(USER_VA), Some(target));
    assert_eq!(m.stats().free_frames, 0);
    assert_eq!(m.kalloc(0x8000), None);
}

#[test]
fn vm_alloc_hands_out_zeroed_frames() {
    let phys = TestPhys::new();
    let m = manager(&phys);
    let free_before = m.stats().free_frames;
    phys.write_u64(0x1_0000, 0xDEAD_BEEF);

    let pa = m.vm_alloc(USER_VA, PagePermissions::WRITABLE).unwrap();
    assert_eq!(pa, 0x1_0000);
    assert_eq!(phys.read_u64(pa), 0);
    assert_eq!(m.translate(USER_VA + 8), Some(pa + 8));
    assert_eq!(m.stats().free_frames, free_before - 4);

    m.vm_free(USER_VA).unwrap();
    assert_eq!(m.stats().free_frames, free_before);
    assert_eq!(
        m.free_frame(PhysicalFrame::from_number(0x10)),
        Err(MemoryError::DoubleFree { address: pa })
    );
    assert_eq!(m.vm_free(USER_VA), Err(MemoryError::Unmapped { address: USER_VA }));
}

#[test]
fn bootloader_memory_is_reclaimed_once() {
    let phys = TestPhys::new();
    let m = manager(&phys);
    let map = memory_map();
    let free_before = m.stats().free_frames;

    assert_eq!(m.reclaim_bootloader_memory(&map), 16);
    assert_eq!(m.stats().free_frames, free_before + 16);
    assert_eq!(m.reclaim_bootloader_memory(&map), 0);

    // A map claiming the kernel is reclaimable changes nothing there.
    let bogus = [MemoryRegion::new(0x5_0000, 0x8000, MemoryRegionKind::BootloaderReclaimable)];
    assert_eq!(m.reclaim_bootloader_memory(&bogus), 0);
}

#[test]
fn self_test_leaves_no_trace() {
    let phys = TestPhys::new();
    let m = manager(&phys);
    let before = m.stats();
    assert_eq!(m.self_test(), Ok(()));
    assert_eq!(m.stats(), before);
}

#[test]
fn init_rejects_unusable_setups() {
    let phys = TestPhys::new();
    let image = kernel_image();

    assert!(matches!(
        MemoryManager::init(&[], image, &phys, config()),
        Err(MemoryError::NoUsableMemory)
    ));
    let reserved = [MemoryRegion::new(0, 0x10_0000, MemoryRegionKind::Reserved)];
    assert!(matches!(
        MemoryManager::init(&reserved, image, &phys, config()),
        Err(MemoryError::NoUsableMemory)
    ));
    assert!(matches!(
        MemoryManager::init(&memory_map(), image, &phys, config().with_heap_max_size(0)),
        Err(MemoryError::InvalidConfig("heap window must not be empty"))
    ));

    let tiny = [MemoryRegion::new(0, 0x8000, MemoryRegionKind::Usable)];
    let greedy = MemoryConfig::new()
        .with_heap_initial_size(0x1_0000)
        .with_heap_max_size(0x1_0000)
        .with_kernel_image_mapping(false);
    assert!(matches!(
        MemoryManager::init(&tiny, image, &phys, greedy),
        Err(MemoryError::OutOfMemory)
    ));
}

#[test]
fn concurrent_kalloc_and_kfree() {
    let phys = TestPhys::new();
    let m = manager(&phys);

    thread::scope(|s| {
        for t in 0..4 {
            let m = &m;
            s.spawn(move || {
                for i in 0..200 {
                    let p = m.kalloc(16 + (i + t) % 64).expect("heap has room");
                    m.kfree(p).expect("own allocation");
                }
            });
        }
    });

    let stats = m.stats();
    assert_eq!(stats.heap_used, 0);
    assert_eq!(stats.heap_blocks, 1);
}
