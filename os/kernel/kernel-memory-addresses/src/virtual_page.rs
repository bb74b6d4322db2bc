use crate::{AddressError, FRAME_SHIFT, FRAME_SIZE, VirtualAddress};
use core::fmt;

/// Base of a 4 KiB virtual page.
///
/// ### Invariants
/// - The low 12 bits are zero.
/// - Pages built through [`from_start_address`](Self::from_start_address) are canonical.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage(VirtualAddress);

impl VirtualPage {
    /// Build a page from its exact start address.
    ///
    /// # Errors
    /// - [`AddressError::NotAligned`] if `address` is not 4 KiB-aligned.
    /// - [`AddressError::NonCanonical`] if `address` is outside the canonical halves.
    #[inline]
    pub const fn from_start_address(address: VirtualAddress) -> Result<Self, AddressError> {
        if !address.is_aligned(FRAME_SIZE) {
            return Err(AddressError::NotAligned {
                address: address.as_u64(),
                alignment: FRAME_SIZE,
            });
        }
        if !address.is_canonical() {
            return Err(AddressError::NonCanonical(address.as_u64()));
        }
        Ok(Self(address))
    }

    /// The page containing `address` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing_address(address: VirtualAddress) -> Self {
        Self(address.align_down(FRAME_SIZE))
    }

    #[inline]
    #[must_use]
    pub const fn start_address(self) -> VirtualAddress {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn number(self) -> u64 {
        self.0.as_u64() >> FRAME_SHIFT
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        self.add_pages(1)
    }

    #[inline]
    #[must_use]
    pub const fn add_pages(self, n: u64) -> Self {
        Self(VirtualAddress::new(self.0.as_u64() + n * FRAME_SIZE))
    }
}

impl fmt::Debug for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage(0x{:016X})", self.0.as_u64())
    }
}

impl fmt::Display for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}/4K", self.0.as_u64())
    }
}

impl TryFrom<VirtualAddress> for VirtualPage {
    type Error = AddressError;

    #[inline]
    fn try_from(value: VirtualAddress) -> Result<Self, Self::Error> {
        Self::from_start_address(value)
    }
}
