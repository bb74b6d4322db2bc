//! # Memory Manager
//!
//! Brings the frame allocator, the kernel address space and the heap up from
//! the boot memory map, and exposes the small API the rest of the kernel uses.
//!
//! ## Initialization
//!
//! ```text
//!  memory map ──► bootstrap allocator ──► bitmap storage
//!                                          │
//!                 BitmapFrameAllocator ◄───┘  (all used, then usable regions released;
//!                        │                     frame 0, kernel image, bitmap reserved)
//!                        ▼
//!                  AddressSpace  ── direct map of every region at `direct_map_offset`
//!                        │       ── kernel image at its link address
//!                        ▼
//!                  HeapAllocator ── initial window backed with fresh frames
//! ```
//!
//! ## Locking
//!
//! The frame allocator, the address space and the heap each sit behind their
//! own [`SpinLock`]. Operations needing several take them in the order
//! heap → address space → frames. Heap growth locks the address space and the
//! frames only while it maps new pages.

use crate::bitmap::words_for;
use crate::bootstrap::{BootstrapFrameAllocator, Claim};
use crate::config::MemoryConfig;
use crate::error::MemoryError;
use crate::frame_alloc::{BitmapFrameAllocator, FrameState};
use crate::heap::{HeapAllocator, HeapBacking, HeapError};
use crate::phys_mapper::OffsetPhysMapper;
use crate::vmm::{KERNEL_DATA, Vmm};
use core::ptr::NonNull;
use kernel_info::boot::{KernelImage, MemoryRegion, MemoryRegionKind};
use kernel_info::memory::{HHDM_MAX_SPAN, SELF_TEST_PAGE};
use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress, PhysicalFrame, VirtualAddress, frames_for};
use kernel_sync::SpinLock;
use kernel_vmem::{AddressSpace, MapMode, PagePermissions, PhysMapper, UnmapMode};
use log::{debug, error, info, warn};

/// Permissions of the kernel image mapping.
const KERNEL_IMAGE: PagePermissions = PagePermissions::WRITABLE.union(PagePermissions::GLOBAL);

/// Point-in-time counters, see [`MemoryManager::stats`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryStats {
    pub total_frames: usize,
    pub free_frames: usize,
    pub used_frames: usize,
    pub page_tables: usize,
    pub heap_mapped: u64,
    pub heap_used: u64,
    pub heap_free: u64,
    pub heap_blocks: usize,
}

pub struct MemoryManager<'m, M: PhysMapper> {
    heap: SpinLock<HeapAllocator>,
    space: SpinLock<AddressSpace<'m, M>>,
    frames: SpinLock<BitmapFrameAllocator<'m>>,
    mapper: &'m M,
    direct: OffsetPhysMapper,
    config: MemoryConfig,
    kernel: KernelImage,
    bitmap: Claim,
}

impl<'m, M: PhysMapper> MemoryManager<'m, M> {
    /// Build the memory manager from the boot memory map.
    ///
    /// `mapper` must reach every physical frame listed as usable in
    /// `memory_map` (at boot: through the bootloader's HHDM). The new address
    /// space is not loaded; call [`activate`](Self::activate) for that.
    ///
    /// # Errors
    /// - [`MemoryError::InvalidConfig`] if `config` is inconsistent.
    /// - [`MemoryError::NoUsableMemory`] if the map lists no usable memory.
    /// - [`MemoryError::OutOfMemory`] if there is not enough memory for the
    ///   bitmap, the page tables or the initial heap.
    /// - [`MemoryError::AlignmentViolation`] if the kernel image is not page aligned.
    pub fn init(
        memory_map: &[MemoryRegion],
        kernel: KernelImage,
        mapper: &'m M,
        config: MemoryConfig,
    ) -> Result<Self, MemoryError> {
        config.validate()?;

        let top = memory_map
            .iter()
            .filter(|r| r.kind != MemoryRegionKind::Reserved)
            .map(|r| r.end().align_down(FRAME_SIZE).as_u64())
            .max()
            .filter(|top| *top > FRAME_SIZE)
            .ok_or(MemoryError::NoUsableMemory)?;
        if top > HHDM_MAX_SPAN {
            return Err(MemoryError::InvalidConfig("physical memory exceeds the direct map"));
        }
        let total_frames = usize::try_from(top / FRAME_SIZE)
            .map_err(|_| MemoryError::InvalidConfig("physical memory too large to track"))?;

        // Bitmap storage, placed before anything can track frames.
        let mut bootstrap = BootstrapFrameAllocator::new(memory_map, kernel);
        let words = words_for(total_frames);
        let bitmap_frames = frames_for(words as u64 * 8);
        let storage_frame = bootstrap
            .allocate_contiguous(bitmap_frames)
            .ok_or(MemoryError::OutOfMemory)?;
        let storage = unsafe {
            let first: *mut u64 = mapper.phys_to_mut::<u64>(storage_frame.start_address());
            core::slice::from_raw_parts_mut(first, words)
        };

        let mut frames =
            BitmapFrameAllocator::new_all_used(PhysicalAddress::zero(), total_frames, storage)?;
        for region in memory_map.iter().filter(|r| r.is_usable()) {
            frames.release_region(region.base, region.length);
        }
        frames.reserve_region(PhysicalAddress::zero(), FRAME_SIZE);
        frames.reserve_region(kernel.phys_start, kernel.len());
        for claim in bootstrap.claims() {
            frames.reserve_region(claim.start.start_address(), claim.bytes());
        }
        let bitmap = Claim {
            start: storage_frame,
            frames: bitmap_frames,
        };
        info!(
            "frames: {} total, {} free; bitmap at {storage_frame} ({bitmap_frames} frames)",
            frames.total_frames(),
            frames.free_frames()
        );

        let direct = OffsetPhysMapper::new(config.direct_map_offset, top);
        let mut space = AddressSpace::new(mapper, &mut frames)?;
        let mut vmm = Vmm::new(&mut space, &mut frames);
        for region in memory_map {
            Self::map_direct(&mut vmm, direct, region)?;
        }
        if config.map_kernel_image && !kernel.is_empty() {
            vmm.map_range(kernel.virt_start, kernel.phys_start, kernel.len(), KERNEL_IMAGE)?;
        }

        let mut heap: HeapAllocator =
            HeapAllocator::new(VirtualAddress::new(config.heap_start), config.heap_max_size);
        heap.init(&mut vmm, config.heap_initial_size)?;
        info!(
            "kernel space ready: root {}, {} page tables, heap {} bytes at {}",
            space.root(),
            space.table_count(),
            heap.mapped_size(),
            heap.start()
        );

        Ok(Self {
            heap: SpinLock::new(heap),
            space: SpinLock::new(space),
            frames: SpinLock::new(frames),
            mapper,
            direct,
            config,
            kernel,
            bitmap,
        })
    }

    /// Alias one region, page by page, skipping pages an earlier region
    /// already covered. Parts above the managed range are left out.
    fn map_direct<A: kernel_vmem::FrameAlloc + ?Sized>(
        vmm: &mut Vmm<'_, 'm, M, A>,
        direct: OffsetPhysMapper,
        region: &MemoryRegion,
    ) -> Result<(), MemoryError> {
        let permissions = match region.kind {
            MemoryRegionKind::Reserved => KERNEL_DATA | PagePermissions::CACHE_DISABLE,
            MemoryRegionKind::Usable | MemoryRegionKind::BootloaderReclaimable => KERNEL_DATA,
        };
        let mut pa = region.base.align_down(FRAME_SIZE);
        let end = region
            .end()
            .min(PhysicalAddress::new(direct.span()))
            .align_up(FRAME_SIZE);
        while pa < end {
            let va = direct.phys_to_virt(pa);
            if vmm.translate(va).is_none() {
                vmm.map_range(va, pa, FRAME_SIZE, permissions)?;
            }
            pa += FRAME_SIZE;
        }
        Ok(())
    }

    #[inline]
    #[must_use]
    pub const fn config(&self) -> &MemoryConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub const fn kernel_image(&self) -> &KernelImage {
        &self.kernel
    }

    /// Where the frame bitmap lives.
    #[inline]
    #[must_use]
    pub const fn bitmap_location(&self) -> Claim {
        self.bitmap
    }

    /// Root table of the kernel address space.
    #[must_use]
    pub fn root_table(&self) -> PhysicalFrame {
        self.space.lock().root()
    }

    /// Allocate `size` bytes from the kernel heap, 16-byte aligned.
    ///
    /// `None` when the heap cannot grow any further.
    #[must_use]
    pub fn kalloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.kalloc_aligned(size, 1)
    }

    /// Allocate `size` bytes from the kernel heap aligned to `align`, a power
    /// of two. Alignments below 16 bytes are raised to 16.
    ///
    /// `None` when the heap cannot grow any further or `align` is invalid.
    /// The result is released with [`kfree`](Self::kfree).
    #[must_use]
    pub fn kalloc_aligned(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let mut heap = self.heap.lock();
        let mut backing = LockedBacking {
            space: &self.space,
            frames: &self.frames,
        };
        match heap.allocate_aligned(size, align, &mut backing) {
            Ok(va) => NonNull::new(va.as_mut_ptr()),
            Err(e) => {
                debug!("kalloc({size}, align {align}) failed: {e}");
                None
            }
        }
    }

    /// Return memory obtained from [`kalloc`](Self::kalloc).
    ///
    /// # Errors
    /// [`MemoryError::InvalidPointer`] for foreign pointers and
    /// [`MemoryError::DoubleFree`] for blocks that are already free. The heap
    /// is unchanged in both cases.
    pub fn kfree(&self, pointer: NonNull<u8>) -> Result<(), MemoryError> {
        Ok(self.heap.lock().free(VirtualAddress::from_nonnull(pointer))?)
    }

    /// Map the page at `virt` to the frame at `phys`.
    ///
    /// The frame stays owned by the caller. It must be allocated if it lies in
    /// managed memory; frames outside it (e.g. MMIO) are accepted as is.
    ///
    /// # Errors
    /// - [`MemoryError::AlignmentViolation`] if either address is not page aligned.
    /// - [`MemoryError::NonCanonical`] for a non-canonical `virt`.
    /// - [`MemoryError::ReservedRange`] inside the heap or direct-map window.
    /// - [`MemoryError::FrameNotAllocated`] if `phys` is a free managed frame.
    /// - [`MemoryError::AlreadyMapped`] if `virt` is mapped already.
    /// - [`MemoryError::OutOfMemory`] if a page table could not be allocated.
    pub fn map_page(&self, virt: u64, phys: u64, flags: PagePermissions) -> Result<(), MemoryError> {
        self.map_with(virt, phys, flags, MapMode::Insert).map(|_| ())
    }

    /// Like [`map_page`](Self::map_page), but replaces an existing mapping and
    /// returns the physical address it referenced.
    ///
    /// # Errors
    /// As for [`map_page`](Self::map_page), without `AlreadyMapped`.
    pub fn remap_page(&self, virt: u64, phys: u64, flags: PagePermissions) -> Result<Option<u64>, MemoryError> {
        self.map_with(virt, phys, flags, MapMode::Replace)
    }

    fn map_with(&self, virt: u64, phys: u64, flags: PagePermissions, mode: MapMode) -> Result<Option<u64>, MemoryError> {
        let va = self.check_outside_windows(virt)?;
        let frame = PhysicalFrame::from_start_address(PhysicalAddress::new(phys))?;
        let mut space = self.space.lock();
        let mut frames = self.frames.lock();
        if frames.frame_state(frame) == Some(FrameState::Free) {
            warn!("map_page({virt:#x}): frame {frame} is not allocated");
            return Err(MemoryError::FrameNotAllocated { address: phys });
        }
        let previous = space.map(&mut *frames, va, frame.start_address(), flags, mode)?;
        Ok(previous.map(|f| f.start_address().as_u64()))
    }

    /// Remove the mapping at `virt`. The frame it referenced is not freed.
    ///
    /// # Errors
    /// [`MemoryError::Unmapped`] if nothing is mapped there,
    /// [`MemoryError::ReservedRange`] inside the heap or direct-map window,
    /// [`MemoryError::AlignmentViolation`] for a misaligned `virt`.
    pub fn unmap_page(&self, virt: u64) -> Result<(), MemoryError> {
        let va = self.check_outside_windows(virt)?;
        let mut space = self.space.lock();
        let mut frames = self.frames.lock();
        space.unmap(&mut *frames, va, UnmapMode::KeepFrame)?;
        Ok(())
    }

    /// Physical address `virt` maps to, offset included.
    #[must_use]
    pub fn translate(&self, virt: u64) -> Option<u64> {
        self.space
            .lock()
            .translate(VirtualAddress::new(virt))
            .map(PhysicalAddress::as_u64)
    }

    /// Map a fresh zeroed frame at `virt` and return its physical address.
    ///
    /// # Errors
    /// As for [`map_page`](Self::map_page); the frame is released on failure.
    pub fn vm_alloc(&self, virt: u64, flags: PagePermissions) -> Result<u64, MemoryError> {
        let va = self.check_outside_windows(virt)?;
        let mut space = self.space.lock();
        let mut frames = self.frames.lock();
        let frame = Vmm::new(&mut *space, &mut *frames).vm_alloc(va, flags)?;
        Ok(frame.start_address().as_u64())
    }

    /// Unmap `virt` and release the frame behind it.
    ///
    /// # Errors
    /// As for [`unmap_page`](Self::unmap_page).
    pub fn vm_free(&self, virt: u64) -> Result<(), MemoryError> {
        let va = self.check_outside_windows(virt)?;
        let mut space = self.space.lock();
        let mut frames = self.frames.lock();
        Vmm::new(&mut *space, &mut *frames).vm_free(va)?;
        Ok(())
    }

    fn check_outside_windows(&self, virt: u64) -> Result<VirtualAddress, MemoryError> {
        let va = VirtualAddress::new(virt);
        if self.config.in_heap_window(va) || self.config.in_direct_map(va) {
            warn!("{va} lies in a window owned by the memory manager");
            return Err(MemoryError::ReservedRange { address: virt });
        }
        Ok(va)
    }

    /// Direct-map address of `phys`; `None` past the highest managed frame.
    #[must_use]
    pub const fn phys_to_virt(&self, phys: u64) -> Option<u64> {
        if phys < self.direct.span() {
            Some(self.direct.phys_to_virt(PhysicalAddress::new(phys)).as_u64())
        } else {
            None
        }
    }

    /// Physical address behind a direct-map address.
    #[must_use]
    pub const fn virt_to_phys(&self, virt: u64) -> Option<u64> {
        match self.direct.virt_to_phys(VirtualAddress::new(virt)) {
            Some(pa) => Some(pa.as_u64()),
            None => None,
        }
    }

    /// # Errors
    /// [`MemoryError::OutOfMemory`] if every frame is in use.
    pub fn allocate_frame(&self) -> Result<PhysicalFrame, MemoryError> {
        Ok(self.frames.lock().allocate_frame()?)
    }

    /// # Errors
    /// [`MemoryError::DoubleFree`] or [`MemoryError::OutOfRange`]; the bitmap is unchanged.
    pub fn free_frame(&self, frame: PhysicalFrame) -> Result<(), MemoryError> {
        Ok(self.frames.lock().free_frame(frame)?)
    }

    /// `count` physically contiguous frames, lowest fit first.
    ///
    /// # Errors
    /// [`MemoryError::OutOfMemory`] if no run is long enough.
    pub fn allocate_contiguous(&self, count: usize) -> Result<PhysicalFrame, MemoryError> {
        Ok(self.frames.lock().allocate_contiguous(count)?)
    }

    /// # Errors
    /// As for [`free_frame`](Self::free_frame), for the first offending frame.
    pub fn free_contiguous(&self, start: PhysicalFrame, count: usize) -> Result<(), MemoryError> {
        Ok(self.frames.lock().free_contiguous(start, count)?)
    }

    /// Hand bootloader-reclaimable regions to the frame allocator.
    ///
    /// Call once nothing reads bootloader data any more. Frame 0, the kernel
    /// image and the bitmap stay reserved. Returns the number of frames freed.
    pub fn reclaim_bootloader_memory(&self, memory_map: &[MemoryRegion]) -> usize {
        let mut frames = self.frames.lock();
        let mut reclaimed = 0;
        for region in memory_map
            .iter()
            .filter(|r| r.kind == MemoryRegionKind::BootloaderReclaimable)
        {
            reclaimed += frames.release_region(region.base, region.length);
        }
        for (start, len) in [
            (PhysicalAddress::zero(), FRAME_SIZE),
            (self.kernel.phys_start, self.kernel.len()),
            (self.bitmap.start.start_address(), self.bitmap.bytes()),
        ] {
            reclaimed = reclaimed.saturating_sub(frames.reserve_region(start, len));
        }
        info!("reclaimed {reclaimed} bootloader frames");
        reclaimed
    }

    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        let heap = self.heap.lock();
        let space = self.space.lock();
        let frames = self.frames.lock();
        MemoryStats {
            total_frames: frames.total_frames(),
            free_frames: frames.free_frames(),
            used_frames: frames.used_frames(),
            page_tables: space.table_count(),
            heap_mapped: heap.mapped_size(),
            heap_used: heap.used_bytes(),
            heap_free: heap.free_capacity(),
            heap_blocks: heap.block_count(),
        }
    }

    pub fn log_summary(&self) {
        let s = self.stats();
        info!(
            "memory: {} of {} frames free ({} KiB), {} page tables",
            s.free_frames,
            s.total_frames,
            s.free_frames as u64 * FRAME_SIZE / 1024,
            s.page_tables
        );
        info!(
            "heap: {} bytes mapped, {} used, {} free in {} blocks",
            s.heap_mapped, s.heap_used, s.heap_free, s.heap_blocks
        );
    }

    /// Exercise the heap and the page tables once and check that both end up
    /// where they started.
    ///
    /// # Errors
    /// The first failing step; results are also logged.
    pub fn self_test(&self) -> Result<(), MemoryError> {
        let before = self.stats();

        let sizes = [0, 24, 4000, 100];
        let mut pointers = [None; 4];
        for (slot, size) in pointers.iter_mut().zip(sizes) {
            *slot = Some(self.kalloc(size).ok_or(MemoryError::OutOfMemory)?);
        }
        for pointer in pointers.iter().rev().flatten() {
            self.kfree(*pointer)?;
        }
        self.heap.lock().validate()?;
        let heap_ok = self.stats().heap_free >= before.heap_free;
        info!("self-test: heap {}", if heap_ok { "ok" } else { "leaked" });

        let pa = self.vm_alloc(SELF_TEST_PAGE, KERNEL_DATA)?;
        let pattern = unsafe { self.mapper.phys_to_mut::<[u64; 4]>(PhysicalAddress::new(pa)) };
        let zeroed = pattern.iter().all(|w| *w == 0);
        pattern.fill(0x5A5A_5A5A_5A5A_5A5A);
        let mapped = self.translate(SELF_TEST_PAGE + 8) == Some(pa + 8);
        self.vm_free(SELF_TEST_PAGE)?;
        let unmapped = self.translate(SELF_TEST_PAGE).is_none();
        let vmm_ok = zeroed && mapped && unmapped;
        info!("self-test: vmm {}", if vmm_ok { "ok" } else { "FAILED" });

        if heap_ok && vmm_ok && self.stats().free_frames == before.free_frames {
            Ok(())
        } else {
            error!("self-test failed");
            Err(MemoryError::Corrupted { address: SELF_TEST_PAGE })
        }
    }

    /// Load the kernel address space into CR3.
    ///
    /// # Safety
    /// The running code, its stack and everything it touches afterwards must
    /// be mapped in the kernel space, and `mapper` must stay valid once the
    /// bootloader's tables are gone.
    pub unsafe fn activate(&self) {
        let mut space = self.space.lock();
        unsafe { space.activate() };
        info!("activated kernel address space {}", space.root());
    }
}

/// Heap backing that takes the address-space and frame locks per growth step.
struct LockedBacking<'s, 'm, M: PhysMapper> {
    space: &'s SpinLock<AddressSpace<'m, M>>,
    frames: &'s SpinLock<BitmapFrameAllocator<'m>>,
}

impl<M: PhysMapper> HeapBacking for LockedBacking<'_, '_, M> {
    fn back(&mut self, start: VirtualAddress, bytes: u64) -> Result<(), HeapError> {
        let mut space = self.space.lock();
        let mut frames = self.frames.lock();
        Vmm::new(&mut *space, &mut *frames).back(start, bytes)
    }
}
