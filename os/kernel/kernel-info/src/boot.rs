//! # Kernel Boot Information

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// What a physical memory range may be used for.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemoryRegionKind {
    /// Free RAM the kernel may hand out.
    Usable = 0,
    /// Firmware, MMIO, ACPI tables or otherwise off limits.
    Reserved = 1,
    /// Holds bootloader data now; becomes usable once the kernel is done with it.
    BootloaderReclaimable = 2,
}

/// One entry of the boot memory map.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryRegion {
    /// Physical start address.
    pub base: PhysicalAddress,
    /// Length in bytes.
    pub length: u64,
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    #[inline]
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: MemoryRegionKind) -> Self {
        Self {
            base: PhysicalAddress::new(base),
            length,
            kind,
        }
    }

    /// Exclusive end address, saturating at the top of the address space.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base.as_u64().saturating_add(self.length))
    }

    #[inline]
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self.kind, MemoryRegionKind::Usable)
    }
}

/// Where the kernel image lives.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct KernelImage {
    /// First physical byte of the image.
    pub phys_start: PhysicalAddress,
    /// One past the last physical byte of the image.
    pub phys_end: PhysicalAddress,
    /// Virtual address `phys_start` is linked at.
    pub virt_start: VirtualAddress,
}

impl KernelImage {
    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.phys_end.as_u64().saturating_sub(self.phys_start.as_u64())
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `[start, end)` intersects the physical image.
    #[inline]
    #[must_use]
    pub const fn overlaps(&self, start: PhysicalAddress, end: PhysicalAddress) -> bool {
        start.as_u64() < self.phys_end.as_u64() && self.phys_start.as_u64() < end.as_u64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_end_saturates() {
        let r = MemoryRegion::new(u64::MAX - 10, 100, MemoryRegionKind::Reserved);
        assert_eq!(r.end().as_u64(), u64::MAX);
        assert!(!r.is_usable());
    }

    #[test]
    fn kernel_image_overlap() {
        let k = KernelImage {
            phys_start: PhysicalAddress::new(0x10_0000),
            phys_end: PhysicalAddress::new(0x10_8000),
            virt_start: VirtualAddress::new(0xffff_ffff_8000_0000),
        };
        assert_eq!(k.len(), 0x8000);
        assert!(k.overlaps(PhysicalAddress::new(0x10_7000), PhysicalAddress::new(0x10_9000)));
        assert!(!k.overlaps(PhysicalAddress::new(0x10_8000), PhysicalAddress::new(0x10_9000)));
        assert!(!k.overlaps(PhysicalAddress::new(0x0F_0000), PhysicalAddress::new(0x10_0000)));
    }
}
