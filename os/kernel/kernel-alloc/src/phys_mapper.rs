//! # Offset-based PhysMapper for Kernel Virtual Memory
//!
//! With a direct map, every physical address `pa` is visible at
//! `offset + pa`. This module provides the [`PhysMapper`] for that layout and
//! the O(1) conversions in both directions.
//!
//! ## Why is this needed?
//! - Code can only dereference virtual addresses, not physical ones.
//! - Page tables and the frame bitmap live in physical frames and have to be
//!   reached through *some* mapping.
//! - The mapping differs between boot (the bootloader's HHDM), the kernel's own
//!   direct map and host tests, so [`PhysMapper`] abstracts over it.
//!
//! ## Example
//! ```rust
//! use kernel_alloc::phys_mapper::OffsetPhysMapper;
//! use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
//!
//! let mapper = OffsetPhysMapper::hhdm();
//! let va = mapper.phys_to_virt(PhysicalAddress::new(0x1234_0000));
//! assert_eq!(va, VirtualAddress::new(0xffff_8880_1234_0000));
//! assert_eq!(mapper.virt_to_phys(va), Some(PhysicalAddress::new(0x1234_0000)));
//! ```

use kernel_info::memory::{HHDM_BASE, HHDM_MAX_SPAN};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] for a linear direct map at a fixed virtual offset.
///
/// # Safety
/// - The direct map must be present and cover every physical address that is
///   turned into a reference.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct OffsetPhysMapper {
    offset: u64,
    span: u64,
}

impl OffsetPhysMapper {
    /// A direct map of up to `span` bytes of physical memory at `offset`.
    #[inline]
    #[must_use]
    pub const fn new(offset: u64, span: u64) -> Self {
        Self { offset, span }
    }

    /// The kernel's higher-half direct map.
    #[inline]
    #[must_use]
    pub const fn hhdm() -> Self {
        Self::new(HHDM_BASE, HHDM_MAX_SPAN)
    }

    #[inline]
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Bytes of physical memory covered.
    #[inline]
    #[must_use]
    pub const fn span(&self) -> u64 {
        self.span
    }

    #[inline]
    #[must_use]
    pub const fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(self.offset + pa.as_u64())
    }

    /// `None` if `va` is outside the direct map.
    #[inline]
    #[must_use]
    pub const fn virt_to_phys(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        match va.as_u64().checked_sub(self.offset) {
            Some(pa) if pa < self.span => Some(PhysicalAddress::new(pa)),
            _ => None,
        }
    }
}

impl PhysMapper for OffsetPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let ptr = self.phys_to_virt(pa).as_mut_ptr::<T>();
        // SAFETY: Caller must ensure the physical address is covered by the direct map.
        unsafe { &mut *ptr }
    }
}
