use crate::{AddressError, FRAME_SHIFT, FRAME_SIZE, PhysicalAddress};
use core::fmt;

/// Base of a 4 KiB physical frame.
///
/// ### Invariants
/// - The low 12 bits of the base are always zero.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let frame = PhysicalFrame::from_start_address(PhysicalAddress::new(0x5000)).unwrap();
/// assert_eq!(frame.number(), 5);
/// assert_eq!(frame.end_address().as_u64(), 0x6000);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalFrame(PhysicalAddress);

impl PhysicalFrame {
    /// Build a frame from its exact start address.
    ///
    /// # Errors
    /// [`AddressError::NotAligned`] if `address` is not 4 KiB-aligned.
    #[inline]
    pub const fn from_start_address(address: PhysicalAddress) -> Result<Self, AddressError> {
        if address.is_aligned(FRAME_SIZE) {
            Ok(Self(address))
        } else {
            Err(AddressError::NotAligned {
                address: address.as_u64(),
                alignment: FRAME_SIZE,
            })
        }
    }

    /// The frame containing `address` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing_address(address: PhysicalAddress) -> Self {
        Self(address.align_down(FRAME_SIZE))
    }

    /// The frame with the global frame number `number` (`address / 4096`).
    #[inline]
    #[must_use]
    pub const fn from_number(number: u64) -> Self {
        Self(PhysicalAddress::new(number << FRAME_SHIFT))
    }

    #[inline]
    #[must_use]
    pub const fn start_address(self) -> PhysicalAddress {
        self.0
    }

    /// Exclusive end address of the frame.
    #[inline]
    #[must_use]
    pub const fn end_address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0.as_u64() + FRAME_SIZE)
    }

    #[inline]
    #[must_use]
    pub const fn number(self) -> u64 {
        self.0.as_u64() >> FRAME_SHIFT
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        self.add_frames(1)
    }

    /// The frame `n` frames above this one.
    #[inline]
    #[must_use]
    pub const fn add_frames(self, n: u64) -> Self {
        Self::from_number(self.number() + n)
    }
}

impl fmt::Debug for PhysicalFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalFrame(0x{:016X})", self.0.as_u64())
    }
}

impl fmt::Display for PhysicalFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}/4K", self.0.as_u64())
    }
}

impl TryFrom<PhysicalAddress> for PhysicalFrame {
    type Error = AddressError;

    #[inline]
    fn try_from(value: PhysicalAddress) -> Result<Self, Self::Error> {
        Self::from_start_address(value)
    }
}
