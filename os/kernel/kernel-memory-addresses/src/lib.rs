//! # Physical and Virtual Memory Address Types
//!
//! Strongly typed wrappers for raw addresses and 4 KiB frame/page bases used
//! by the frame allocator, the heap and the page-table code.
//!
//! ## Overview
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A byte address in physical memory (RAM or MMIO). |
//! | [`VirtualAddress`] | A byte address translated through the page tables. |
//! | [`PhysicalFrame`] | The 4 KiB-aligned base of a physical frame. |
//! | [`VirtualPage`] | The 4 KiB-aligned base of a virtual page. |
//!
//! Frame and page types can only be built from aligned addresses
//! ([`PhysicalFrame::from_start_address`]) or by rounding down explicitly
//! ([`PhysicalFrame::containing_address`]). Misaligned input is reported as
//! [`AddressError::NotAligned`], never silently truncated.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x0020_1234);
//! let frame = PhysicalFrame::containing_address(pa);
//! assert_eq!(frame.start_address().as_u64(), 0x0020_1000);
//! assert_eq!(frame.number(), 0x201);
//!
//! assert!(PhysicalFrame::from_start_address(pa).is_err());
//!
//! let va = VirtualAddress::new(0xFFFF_8000_0000_2000);
//! assert!(va.is_canonical());
//! assert_eq!(VirtualPage::from_start_address(va).map(VirtualPage::start_address), Ok(va));
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod physical_address;
mod physical_frame;
mod virtual_address;
mod virtual_page;

pub use crate::physical_address::PhysicalAddress;
pub use crate::physical_frame::PhysicalFrame;
pub use crate::virtual_address::VirtualAddress;
pub use crate::virtual_page::VirtualPage;

/// Size of a physical frame / virtual page in bytes.
pub const FRAME_SIZE: u64 = 4096;

/// `log2(FRAME_SIZE)`.
pub const FRAME_SHIFT: u32 = 12;

const _: () = assert!(1 << FRAME_SHIFT == FRAME_SIZE);

/// Errors raised when constructing aligned address types.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum AddressError {
    /// The address is not a multiple of the required alignment.
    #[error("address {address:#018x} is not aligned to {alignment:#x} bytes")]
    NotAligned { address: u64, alignment: u64 },
    /// Bits 63..48 of a virtual address do not replicate bit 47.
    #[error("virtual address {0:#018x} is not canonical")]
    NonCanonical(u64),
}

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0, 4096), 0);
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(8191, 4096), 4096);
/// assert_eq!(align_down(0x12345, 16), 0x12340);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two and `x + a - 1` must not overflow;
/// use [`checked_align_up`] when the input is untrusted.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(0, 4096), 0);
/// assert_eq!(align_up(1, 4096), 4096);
/// assert_eq!(align_up(4096, 4096), 4096);
/// assert_eq!(align_up(0x12345, 16), 0x12350);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}

/// Overflow-checked variant of [`align_up`].
///
/// ```rust
/// # use kernel_memory_addresses::checked_align_up;
/// assert_eq!(checked_align_up(4097, 4096), Some(8192));
/// assert_eq!(checked_align_up(u64::MAX, 4096), None);
/// ```
#[inline]
#[must_use]
pub const fn checked_align_up(x: u64, a: u64) -> Option<u64> {
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}

/// Whether `x` is a multiple of `a` (a power of two).
#[inline(always)]
#[must_use]
pub const fn is_aligned(x: u64, a: u64) -> bool {
    x & (a - 1) == 0
}

/// Number of whole frames needed to hold `bytes` bytes.
///
/// ```rust
/// # use kernel_memory_addresses::frames_for;
/// assert_eq!(frames_for(0), 0);
/// assert_eq!(frames_for(1), 1);
/// assert_eq!(frames_for(8192), 2);
/// ```
#[inline]
#[must_use]
pub const fn frames_for(bytes: u64) -> u64 {
    bytes.div_ceil(FRAME_SIZE)
}
