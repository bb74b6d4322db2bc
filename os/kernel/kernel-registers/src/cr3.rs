use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalFrame};

/// CR3 — Page-Map Level-4 Base Register (IA-32e, PCID disabled).
///
/// Holds the physical frame of the root (PML4) table and the cache-control
/// flags used when the CPU reads it.
#[bitfield(u64)]
pub struct Cr3 {
    /// Bits 0–2 — Reserved (must be 0).
    #[bits(3)]
    __: u8,

    /// Bit 3 — PWT: Page-level Write-Through for PML4.
    pub pwt: bool,

    /// Bit 4 — PCD: Page-level Cache Disable for PML4.
    pub pcd: bool,

    /// Bits 5–11 — Reserved (must be 0 when written).
    #[bits(7)]
    __: u8,

    /// Bits 12–51 — root table frame number.
    #[bits(40)]
    root_frame_number: u64,

    /// Bits 52–63 — Reserved.
    #[bits(12)]
    __: u16,
}

impl Cr3 {
    /// CR3 value selecting `root` with write-back caching.
    #[must_use]
    pub const fn from_root_table(root: PhysicalFrame) -> Self {
        Self::new().with_root_frame_number(root.number())
    }

    /// Frame of the root table this value points at.
    #[must_use]
    pub const fn root_table(&self) -> PhysicalFrame {
        PhysicalFrame::from_number(self.root_frame_number())
    }

    /// Physical address of the root table.
    #[must_use]
    pub const fn root_table_address(&self) -> PhysicalAddress {
        self.root_table().start_address()
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let mut cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}
