#![allow(dead_code)]

use kernel_alloc::MemoryConfig;
use kernel_info::boot::{KernelImage, MemoryRegion, MemoryRegionKind};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PhysMapper;
use std::cell::UnsafeCell;

pub const FRAMES: usize = 256;
pub const KERNEL_VIRT: u64 = 0xffff_ffff_8000_0000;

#[repr(align(4096))]
pub struct Aligned4K([u8; 4096]);

/// 1 MiB of simulated RAM; physical address 0 is the first byte.
pub struct TestPhys {
    frames: Box<[UnsafeCell<Aligned4K>]>,
}

// Tests only touch frames they own through the memory manager's locks.
unsafe impl Sync for TestPhys {}

impl TestPhys {
    pub fn new() -> Self {
        Self {
            frames: (0..FRAMES).map(|_| UnsafeCell::new(Aligned4K([0; 4096]))).collect(),
        }
    }

    pub fn leaked() -> &'static Self {
        Box::leak(Box::new(Self::new()))
    }

    pub fn read_u64(&self, pa: u64) -> u64 {
        unsafe { *self.phys_to_mut::<u64>(PhysicalAddress::new(pa)) }
    }

    pub fn write_u64(&self, pa: u64, value: u64) {
        unsafe { *self.phys_to_mut::<u64>(PhysicalAddress::new(pa)) = value };
    }
}

impl PhysMapper for TestPhys {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let offset = usize::try_from(pa.as_u64()).unwrap();
        assert!(offset + size_of::<T>() <= FRAMES * 4096, "{pa} outside simulated memory");
        let base = UnsafeCell::raw_get(self.frames.as_ptr()).cast::<u8>();
        unsafe { &mut *base.add(offset).cast::<T>() }
    }
}

/// ```text
/// 0x00000..0x01000  reserved (real-mode IVT)
/// 0x01000..0x40000  usable
/// 0x40000..0x50000  reserved
/// 0x50000..0x70000  usable, kernel image in 0x50000..0x58000
/// 0x70000..0x80000  bootloader reclaimable
/// 0x80000..0x100000 usable
/// ```
pub fn memory_map() -> [MemoryRegion; 6] {
    [
        MemoryRegion::new(0x0, 0x1000, MemoryRegionKind::Reserved),
        MemoryRegion::new(0x1000, 0x3_F000, MemoryRegionKind::Usable),
        MemoryRegion::new(0x4_0000, 0x1_0000, MemoryRegionKind::Reserved),
        MemoryRegion::new(0x5_0000, 0x2_0000, MemoryRegionKind::Usable),
        MemoryRegion::new(0x7_0000, 0x1_0000, MemoryRegionKind::BootloaderReclaimable),
        MemoryRegion::new(0x8_0000, 0x8_0000, MemoryRegionKind::Usable),
    ]
}

pub fn kernel_image() -> KernelImage {
    KernelImage {
        phys_start: PhysicalAddress::new(0x5_0000),
        phys_end: PhysicalAddress::new(0x5_8000),
        virt_start: VirtualAddress::new(KERNEL_VIRT),
    }
}

/// Default layout with a 16 KiB heap that may grow to 64 KiB.
pub fn config() -> MemoryConfig {
    MemoryConfig::new()
        .with_heap_initial_size(0x4000)
        .with_heap_max_size(0x1_0000)
}
