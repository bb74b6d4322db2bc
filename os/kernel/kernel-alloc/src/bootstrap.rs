//! # Placement allocator for early boot
//!
//! Before the bitmap exists there is nowhere to record frame state, yet the
//! bitmap itself needs frames. [`BootstrapFrameAllocator`] bumps through the
//! usable regions of the boot memory map, never hands out frame 0 or anything
//! overlapping the kernel image, and remembers every span it gave away so the
//! bitmap can mark those spans used once it is built.

use arrayvec::ArrayVec;
use kernel_info::boot::{KernelImage, MemoryRegion};
use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress, PhysicalFrame};
use kernel_vmem::FrameAlloc;
use log::{debug, warn};

/// Maximum number of spans one bootstrap allocator hands out.
pub const MAX_CLAIMS: usize = 8;

/// A run of frames handed out by the bootstrap allocator.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Claim {
    pub start: PhysicalFrame,
    pub frames: u64,
}

impl Claim {
    #[inline]
    #[must_use]
    pub const fn bytes(&self) -> u64 {
        self.frames * FRAME_SIZE
    }
}

pub struct BootstrapFrameAllocator<'r> {
    regions: &'r [MemoryRegion],
    kernel: KernelImage,
    /// Nothing below this address is handed out again.
    cursor: PhysicalAddress,
    claims: ArrayVec<Claim, MAX_CLAIMS>,
}

impl<'r> BootstrapFrameAllocator<'r> {
    #[must_use]
    pub fn new(regions: &'r [MemoryRegion], kernel: KernelImage) -> Self {
        Self {
            regions,
            kernel,
            cursor: PhysicalAddress::new(FRAME_SIZE),
            claims: ArrayVec::new(),
        }
    }

    /// Lowest run of `count` frames above the cursor inside a single usable
    /// region, clear of the kernel image.
    ///
    /// `None` if no region has room or the claim list is full.
    pub fn allocate_contiguous(&mut self, count: u64) -> Option<PhysicalFrame> {
        if count == 0 || self.claims.is_full() {
            return None;
        }
        let bytes = count.checked_mul(FRAME_SIZE)?;
        let start = self
            .regions
            .iter()
            .filter(|r| r.is_usable())
            .filter_map(|r| self.fit_in(r, bytes))
            .min()?;

        let frame = PhysicalFrame::from_start_address(start).ok()?;
        self.cursor = start + bytes;
        self.claims.push(Claim {
            start: frame,
            frames: count,
        });
        debug!("bootstrap: claimed {count} frames at {frame}");
        Some(frame)
    }

    fn fit_in(&self, region: &MemoryRegion, bytes: u64) -> Option<PhysicalAddress> {
        let end = region.end().align_down(FRAME_SIZE);
        let mut start = region.base.align_up(FRAME_SIZE).max(self.cursor);
        let mut candidate_end = start.checked_add(bytes)?;
        if self.kernel.overlaps(start, candidate_end) {
            start = self.kernel.phys_end.align_up(FRAME_SIZE);
            candidate_end = start.checked_add(bytes)?;
        }
        (candidate_end <= end).then_some(start)
    }

    /// Every span handed out so far, in allocation order.
    #[inline]
    #[must_use]
    pub fn claims(&self) -> &[Claim] {
        &self.claims
    }
}

impl FrameAlloc for BootstrapFrameAllocator<'_> {
    fn alloc_4k(&mut self) -> Option<PhysicalFrame> {
        self.allocate_contiguous(1)
    }

    fn free_4k(&mut self, frame: PhysicalFrame) {
        warn!("bootstrap allocator cannot free {frame}; leaking it");
    }
}
