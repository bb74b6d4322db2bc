use crate::frame_alloc::FrameError;
use crate::heap::HeapError;
use crate::vmm::VmmError;
use kernel_memory_addresses::AddressError;
use kernel_vmem::{MapError, UnmapError};

/// Errors reported by the kernel-facing memory API.
///
/// Each component has its own error type; they all convert into this one.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MemoryError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("address {address:#018x} violates the required alignment")]
    AlignmentViolation { address: u64 },
    #[error("double free of {address:#018x}")]
    DoubleFree { address: u64 },
    #[error("{address:#018x} is not mapped")]
    Unmapped { address: u64 },
    #[error("{address:#018x} is already mapped")]
    AlreadyMapped { address: u64 },
    #[error("{address:#018x} is not canonical")]
    NonCanonical { address: u64 },
    #[error("{address:#018x} lies inside a huge page")]
    HugePageConflict { address: u64 },
    #[error("{address:#018x} was not handed out by kalloc")]
    InvalidPointer { address: u64 },
    #[error("frame {address:#018x} is not allocated")]
    FrameNotAllocated { address: u64 },
    #[error("{address:#018x} is outside managed memory")]
    OutOfRange { address: u64 },
    #[error("{address:#018x} lies in a window owned by the memory manager")]
    ReservedRange { address: u64 },
    #[error("heap bookkeeping is inconsistent at {address:#018x}")]
    Corrupted { address: u64 },
    #[error("the memory map has no usable memory")]
    NoUsableMemory,
    #[error("invalid memory configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("memory manager already initialized")]
    AlreadyInitialized,
}

impl From<AddressError> for MemoryError {
    fn from(value: AddressError) -> Self {
        match value {
            AddressError::NotAligned { address, .. } => Self::AlignmentViolation { address },
            AddressError::NonCanonical(address) => Self::NonCanonical { address },
        }
    }
}

impl From<FrameError> for MemoryError {
    fn from(value: FrameError) -> Self {
        match value {
            FrameError::OutOfMemory | FrameError::StorageTooSmall { .. } => Self::OutOfMemory,
            FrameError::Misaligned(e) => e.into(),
            FrameError::DoubleFree(frame) => Self::DoubleFree {
                address: frame.start_address().as_u64(),
            },
            FrameError::OutOfRange(frame) => Self::OutOfRange {
                address: frame.start_address().as_u64(),
            },
            FrameError::NoFrames => Self::NoUsableMemory,
            FrameError::EmptyRun => Self::InvalidArgument("a frame run needs at least one frame"),
        }
    }
}

impl From<HeapError> for MemoryError {
    fn from(value: HeapError) -> Self {
        match value {
            HeapError::OutOfMemory | HeapError::Backing => Self::OutOfMemory,
            HeapError::InvalidPointer(va) => Self::InvalidPointer {
                address: va.as_u64(),
            },
            HeapError::DoubleFree(va) => Self::DoubleFree {
                address: va.as_u64(),
            },
            HeapError::AlreadyInitialized => Self::AlreadyInitialized,
            HeapError::InvalidAlignment(_) => Self::InvalidArgument("alignment must be a power of two"),
            HeapError::Corrupted(va) => Self::Corrupted {
                address: va.as_u64(),
            },
        }
    }
}

impl From<MapError> for MemoryError {
    fn from(value: MapError) -> Self {
        match value {
            MapError::Address(e) => e.into(),
            MapError::AlreadyMapped { page, .. } => Self::AlreadyMapped {
                address: page.start_address().as_u64(),
            },
            MapError::TableAllocation { .. } => Self::OutOfMemory,
            MapError::HugePageConflict { page, .. } => Self::HugePageConflict {
                address: page.start_address().as_u64(),
            },
        }
    }
}

impl From<UnmapError> for MemoryError {
    fn from(value: UnmapError) -> Self {
        match value {
            UnmapError::Address(e) => e.into(),
            UnmapError::NotMapped(page) => Self::Unmapped {
                address: page.start_address().as_u64(),
            },
            UnmapError::HugePageConflict { page, .. } => Self::HugePageConflict {
                address: page.start_address().as_u64(),
            },
        }
    }
}

impl From<VmmError> for MemoryError {
    fn from(value: VmmError) -> Self {
        match value {
            VmmError::OutOfMemory => Self::OutOfMemory,
            VmmError::Map(e) => e.into(),
            VmmError::Unmap(e) => e.into(),
            VmmError::InvalidRange { start, .. } => Self::OutOfRange {
                address: start.as_u64(),
            },
        }
    }
}
