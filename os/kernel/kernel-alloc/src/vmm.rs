//! Minimal Virtual Memory Manager (VMM) for the kernel.
//!
//! Glue between one [`AddressSpace`] and a [`FrameAlloc`]: map runs of pages,
//! either onto fresh zeroed frames (anonymous memory, owned by the mapping) or
//! onto a given physical range (aliases such as the direct map, not owned).
//! Multi-page operations are all-or-nothing: a failure part way through
//! unmaps whatever the call had already mapped.
//!
//! # Example
//! ```ignore
//! let mut vmm = Vmm::new(&mut space, &mut frames);
//! vmm.map_anon_pages(VirtualAddress::new(KERNEL_HEAP_BASE), 4, KERNEL_DATA)?;
//! ```

use crate::heap::{HeapBacking, HeapError};
use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress, PhysicalFrame, VirtualAddress};
use kernel_vmem::{
    AddressSpace, FrameAlloc, MapError, MapMode, PagePermissions, PhysMapper, UnmapError,
    UnmapMode,
};
use log::{trace, warn};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmmError {
    #[error("out of memory")]
    OutOfMemory,
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Unmap(#[from] UnmapError),
    #[error("invalid range {start} + {bytes:#x}")]
    InvalidRange { start: VirtualAddress, bytes: u64 },
}

impl VmmError {
    /// Whether the failure was caused by running out of frames.
    #[must_use]
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            Self::OutOfMemory | Self::Map(MapError::TableAllocation { .. })
        )
    }
}

/// Kernel data: writable, never executed, kept across CR3 reloads.
pub const KERNEL_DATA: PagePermissions = PagePermissions::WRITABLE
    .union(PagePermissions::NO_EXECUTE)
    .union(PagePermissions::GLOBAL);

/// Borrowed view of one address space and the frames that back it.
pub struct Vmm<'a, 'm, M: PhysMapper, A: FrameAlloc + ?Sized> {
    space: &'a mut AddressSpace<'m, M>,
    frames: &'a mut A,
}

impl<'a, 'm, M: PhysMapper, A: FrameAlloc + ?Sized> Vmm<'a, 'm, M, A> {
    pub const fn new(space: &'a mut AddressSpace<'m, M>, frames: &'a mut A) -> Self {
        Self { space, frames }
    }

    /// Translate VA→PA if mapped.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.space.translate(va)
    }

    /// Map one fresh, zeroed frame at `va`.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] if no frame is left, or the mapping error;
    /// the frame is returned in that case.
    pub fn vm_alloc(
        &mut self,
        va: VirtualAddress,
        permissions: PagePermissions,
    ) -> Result<PhysicalFrame, VmmError> {
        let frame = self.frames.alloc_4k().ok_or(VmmError::OutOfMemory)?;
        unsafe { self.space.mapper().zero_frame(frame) };
        if let Err(e) = self.space.map(
            &mut *self.frames,
            va,
            frame.start_address(),
            permissions,
            MapMode::Insert,
        ) {
            self.frames.free_4k(frame);
            return Err(e.into());
        }
        trace!("vm_alloc {va} -> {frame}");
        Ok(frame)
    }

    /// Unmap `va` and return its frame to the allocator.
    ///
    /// # Errors
    /// The unmap error; nothing changes then.
    pub fn vm_free(&mut self, va: VirtualAddress) -> Result<PhysicalFrame, VmmError> {
        Ok(self
            .space
            .unmap(&mut *self.frames, va, UnmapMode::ReleaseFrame)?)
    }

    /// Map `pages` pages from `start`, each onto a fresh zeroed frame.
    ///
    /// # Errors
    /// As for [`vm_alloc`](Self::vm_alloc). Pages mapped by this call are
    /// unmapped and their frames released before returning.
    pub fn map_anon_pages(
        &mut self,
        start: VirtualAddress,
        pages: u64,
        permissions: PagePermissions,
    ) -> Result<(), VmmError> {
        Self::check_range(start, pages)?;
        for i in 0..pages {
            if let Err(e) = self.vm_alloc(start + i * FRAME_SIZE, permissions) {
                self.rollback(start, i, UnmapMode::ReleaseFrame);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Map `bytes` (rounded up to pages) at `virt` onto the physical range at `phys`.
    ///
    /// The frames are not owned by the mapping.
    ///
    /// # Errors
    /// [`VmmError::InvalidRange`] if the range wraps, or the first mapping
    /// error; pages mapped by this call are unmapped again.
    pub fn map_range(
        &mut self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        bytes: u64,
        permissions: PagePermissions,
    ) -> Result<u64, VmmError> {
        let pages = bytes.div_ceil(FRAME_SIZE);
        Self::check_range(virt, pages)?;
        phys.checked_add(pages * FRAME_SIZE)
            .ok_or(VmmError::InvalidRange { start: virt, bytes })?;
        for i in 0..pages {
            let offset = i * FRAME_SIZE;
            if let Err(e) = self.space.map(
                &mut *self.frames,
                virt + offset,
                phys + offset,
                permissions,
                MapMode::Insert,
            ) {
                self.rollback(virt, i, UnmapMode::KeepFrame);
                return Err(e.into());
            }
        }
        Ok(pages)
    }

    /// Unmap `pages` pages from `start`.
    ///
    /// # Errors
    /// The first unmap error. Pages before it stay unmapped.
    pub fn unmap_pages(
        &mut self,
        start: VirtualAddress,
        pages: u64,
        mode: UnmapMode,
    ) -> Result<(), VmmError> {
        Self::check_range(start, pages)?;
        for i in 0..pages {
            self.space
                .unmap(&mut *self.frames, start + i * FRAME_SIZE, mode)?;
        }
        Ok(())
    }

    fn rollback(&mut self, start: VirtualAddress, pages: u64, mode: UnmapMode) {
        for i in 0..pages {
            let va = start + i * FRAME_SIZE;
            if let Err(e) = self.space.unmap(&mut *self.frames, va, mode) {
                warn!("rollback of {va} failed: {e}");
            }
        }
    }

    fn check_range(start: VirtualAddress, pages: u64) -> Result<(), VmmError> {
        let invalid = VmmError::InvalidRange {
            start,
            bytes: pages.saturating_mul(FRAME_SIZE),
        };
        let bytes = pages.checked_mul(FRAME_SIZE).ok_or(invalid)?;
        start.checked_add(bytes).ok_or(invalid)?;
        Ok(())
    }
}

impl<M: PhysMapper, A: FrameAlloc + ?Sized> HeapBacking for Vmm<'_, '_, M, A> {
    fn back(&mut self, start: VirtualAddress, bytes: u64) -> Result<(), HeapError> {
        self.map_anon_pages(start, bytes.div_ceil(FRAME_SIZE), KERNEL_DATA)
            .map_err(|e| {
                warn!("heap backing at {start} failed: {e}");
                if e.is_out_of_memory() {
                    HeapError::OutOfMemory
                } else {
                    HeapError::Backing
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_alloc::BitmapFrameAllocator;
    use crate::test_support::TestPhys;
    use kernel_vmem::TableLevel;

    const VA: u64 = 0xffff_c000_0000_0000;

    #[test]
    fn anonymous_pages_get_distinct_zeroed_frames() {
        let phys = TestPhys::with_frames(64);
        let mut storage = [0u64; 1];
        let mut frames = BitmapFrameAllocator::new(PhysicalAddress::zero(), 64, &mut storage, 1).unwrap();
        let mut space = AddressSpace::new(&phys, &mut frames).unwrap();

        // Frame 6 becomes the second data page; dirty it so zeroing is observable.
        unsafe { phys.phys_to_mut::<[u8; 4096]>(PhysicalAddress::new(0x6000)) }.fill(0xAA);

        let mut vmm = Vmm::new(&mut space, &mut frames);
        vmm.map_anon_pages(VirtualAddress::new(VA), 3, KERNEL_DATA).unwrap();
        let pas: Vec<_> = (0..3)
            .map(|i| vmm.translate(VirtualAddress::new(VA + i * FRAME_SIZE)).unwrap())
            .collect();
        assert_eq!(pas.len(), 3);
        assert!(pas[0] != pas[1] && pas[1] != pas[2]);
        for pa in pas {
            let bytes = unsafe { phys.phys_to_mut::<[u8; 4096]>(pa) };
            assert!(bytes.iter().all(|b| *b == 0));
        }
    }

    #[test]
    fn failed_anonymous_mapping_releases_everything() {
        let phys = TestPhys::with_frames(16);
        let mut storage = [0u64; 1];
        let mut frames = BitmapFrameAllocator::new(PhysicalAddress::zero(), 16, &mut storage, 1).unwrap();
        let mut space = AddressSpace::new(&phys, &mut frames).unwrap();
        let free_before = frames.free_frames();

        let mut vmm = Vmm::new(&mut space, &mut frames);
        let err = vmm
            .map_anon_pages(VirtualAddress::new(VA), 20, PagePermissions::WRITABLE)
            .unwrap_err();
        assert!(err.is_out_of_memory());
        assert_eq!(vmm.translate(VirtualAddress::new(VA)), None);

        assert_eq!(frames.free_frames(), free_before);
        assert_eq!(space.table_count(), 1);
    }

    #[test]
    fn aliases_are_not_owned() {
        let phys = TestPhys::with_frames(32);
        let mut storage = [0u64; 1];
        let mut frames = BitmapFrameAllocator::new(PhysicalAddress::zero(), 32, &mut storage, 1).unwrap();
        let mut space = AddressSpace::new(&phys, &mut frames).unwrap();
        let mut vmm = Vmm::new(&mut space, &mut frames);

        let pages = vmm
            .map_range(
                VirtualAddress::new(VA),
                PhysicalAddress::new(0x1_8000),
                0x2001,
                PagePermissions::WRITABLE,
            )
            .unwrap();
        assert_eq!(pages, 3);
        assert_eq!(
            vmm.translate(VirtualAddress::new(VA + 0x2010)),
            Some(PhysicalAddress::new(0x1_A010))
        );
        vmm.unmap_pages(VirtualAddress::new(VA), 3, UnmapMode::KeepFrame)
            .unwrap();
        // Root only; frames 0x18..0x1A were never handed out by the allocator.
        assert_eq!(frames.used_frames(), 2);
    }

    #[test]
    fn overlapping_alias_rolls_back_its_own_pages() {
        let phys = TestPhys::with_frames(32);
        let mut storage = [0u64; 1];
        let mut frames = BitmapFrameAllocator::new(PhysicalAddress::zero(), 32, &mut storage, 1).unwrap();
        let mut space = AddressSpace::new(&phys, &mut frames).unwrap();
        let mut vmm = Vmm::new(&mut space, &mut frames);

        let taken = VirtualAddress::new(VA + 2 * FRAME_SIZE);
        vmm.vm_alloc(taken, PagePermissions::WRITABLE).unwrap();
        let err = vmm
            .map_range(VirtualAddress::new(VA), PhysicalAddress::new(0x1_0000), 0x4000, PagePermissions::empty())
            .unwrap_err();
        assert!(matches!(err, VmmError::Map(MapError::AlreadyMapped { .. })));
        assert_eq!(vmm.translate(VirtualAddress::new(VA)), None);
        assert!(vmm.translate(taken).is_some());

        let frame = vmm.vm_free(taken).unwrap();
        assert_eq!(vmm.translate(taken), None);
        assert!(matches!(
            space.entry(taken, TableLevel::Pml4),
            Some(kernel_vmem::PageTableEntry::Absent)
        ));
        assert_eq!(frames.frame_state(frame), Some(crate::frame_alloc::FrameState::Free));
    }

    #[test]
    fn wrapping_ranges_are_rejected() {
        let phys = TestPhys::with_frames(8);
        let mut storage = [0u64; 1];
        let mut frames = BitmapFrameAllocator::new(PhysicalAddress::zero(), 8, &mut storage, 1).unwrap();
        let mut space = AddressSpace::new(&phys, &mut frames).unwrap();
        let mut vmm = Vmm::new(&mut space, &mut frames);
        assert!(matches!(
            vmm.map_anon_pages(VirtualAddress::new(u64::MAX - 0xFFF), 2, PagePermissions::empty()),
            Err(VmmError::InvalidRange { .. })
        ));
    }

    #[test]
    fn heap_backing_maps_and_reports_oom() {
        let phys = TestPhys::with_frames(16);
        let mut storage = [0u64; 1];
        let mut frames = BitmapFrameAllocator::new(PhysicalAddress::zero(), 16, &mut storage, 1).unwrap();
        let mut space = AddressSpace::new(&phys, &mut frames).unwrap();
        let mut vmm = Vmm::new(&mut space, &mut frames);

        assert_eq!(vmm.back(VirtualAddress::new(VA), 0x2000), Ok(()));
        assert!(vmm.translate(VirtualAddress::new(VA + 0x1FFF)).is_some());
        assert_eq!(
            vmm.back(VirtualAddress::new(VA + 0x2000), 0x10_0000),
            Err(HeapError::OutOfMemory)
        );
        assert_eq!(vmm.translate(VirtualAddress::new(VA + 0x2000)), None);
    }
}
