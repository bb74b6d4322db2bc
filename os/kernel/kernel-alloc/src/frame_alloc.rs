//! # Physical Frame Allocator
//!
//! A bitmap over a contiguous range of physical frames, one bit per 4 KiB
//! frame, `1 = used`. Allocation always returns the lowest free frame; a hint
//! remembers the lowest word that may still hold a clear bit so repeated
//! allocations do not rescan the full prefix.
//!
//! ```text
//!  base                                                    base + total * 4K
//!   │ frame 0 │ frame 1 │ frame 2 │   …   │ frame n-1 │
//!   │   bit 0 │   bit 1 │   bit 2 │   …   │  bit n-1  │   bit = (pa - base) / 4K
//! ```
//!
//! The storage for the bitmap is handed in by the caller (at boot: a run of
//! frames picked by [`BootstrapFrameAllocator`](crate::bootstrap::BootstrapFrameAllocator)),
//! so the allocator itself never allocates.

use crate::bitmap::{BITS_PER_WORD, Bitmap, words_for};
use kernel_memory_addresses::{AddressError, FRAME_SIZE, PhysicalAddress, PhysicalFrame};
use kernel_vmem::FrameAlloc;
use log::{error, trace, warn};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FrameState {
    Free,
    Used,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("no free frame left")]
    OutOfMemory,
    #[error(transparent)]
    Misaligned(#[from] AddressError),
    #[error("frame {0} is already free")]
    DoubleFree(PhysicalFrame),
    #[error("frame {0} is outside the managed range")]
    OutOfRange(PhysicalFrame),
    #[error("an allocator must manage at least one frame")]
    NoFrames,
    #[error("bitmap storage holds {provided} words, {needed} needed")]
    StorageTooSmall { needed: usize, provided: usize },
    #[error("a contiguous run needs at least one frame")]
    EmptyRun,
}

/// Bitmap-backed allocator for the frames `base .. base + total_frames * 4K`.
pub struct BitmapFrameAllocator<'a> {
    bitmap: Bitmap<&'a mut [u64]>,
    base: PhysicalFrame,
    free: usize,
    /// Lowest word that may contain a clear bit.
    hint: usize,
}

impl<'a> BitmapFrameAllocator<'a> {
    /// Manage `total_frames` frames from `base`; all free except the first
    /// `reserved_prefix`.
    ///
    /// # Errors
    /// [`FrameError::Misaligned`] for a misaligned `base`,
    /// [`FrameError::NoFrames`] for an empty range and
    /// [`FrameError::StorageTooSmall`] if `storage` cannot hold the bitmap.
    pub fn new(
        base: PhysicalAddress,
        total_frames: usize,
        storage: &'a mut [u64],
        reserved_prefix: usize,
    ) -> Result<Self, FrameError> {
        let mut this = Self::new_all_used(base, total_frames, storage)?;
        this.bitmap.fill(false);
        this.free = total_frames;
        let prefix = reserved_prefix.min(total_frames);
        this.free -= this.bitmap.set_range(0, prefix);
        this.hint = prefix / BITS_PER_WORD;
        Ok(this)
    }

    /// Manage `total_frames` frames from `base`, all marked used.
    ///
    /// Usable memory is then handed over with [`release_region`](Self::release_region).
    ///
    /// # Errors
    /// As for [`new`](Self::new).
    pub fn new_all_used(
        base: PhysicalAddress,
        total_frames: usize,
        storage: &'a mut [u64],
    ) -> Result<Self, FrameError> {
        let base = PhysicalFrame::from_start_address(base)?;
        if total_frames == 0 {
            return Err(FrameError::NoFrames);
        }
        let provided = storage.len();
        let bitmap = Bitmap::new(storage, total_frames, true).ok_or(FrameError::StorageTooSmall {
            needed: words_for(total_frames),
            provided,
        })?;
        Ok(Self {
            bitmap,
            base,
            free: 0,
            hint: 0,
        })
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> PhysicalFrame {
        self.base
    }

    /// One past the last managed frame.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> PhysicalFrame {
        self.base.add_frames(self.bitmap.len() as u64)
    }

    #[inline]
    #[must_use]
    pub const fn total_frames(&self) -> usize {
        self.bitmap.len()
    }

    #[inline]
    #[must_use]
    pub const fn free_frames(&self) -> usize {
        self.free
    }

    #[inline]
    #[must_use]
    pub const fn used_frames(&self) -> usize {
        self.bitmap.len() - self.free
    }

    #[must_use]
    pub fn contains(&self, frame: PhysicalFrame) -> bool {
        self.index_of(frame).is_some()
    }

    fn index_of(&self, frame: PhysicalFrame) -> Option<usize> {
        let index = usize::try_from(frame.number().checked_sub(self.base.number())?).ok()?;
        (index < self.bitmap.len()).then_some(index)
    }

    fn frame_at(&self, index: usize) -> PhysicalFrame {
        self.base.add_frames(index as u64)
    }

    /// `None` for frames outside the managed range.
    #[must_use]
    pub fn frame_state(&self, frame: PhysicalFrame) -> Option<FrameState> {
        let index = self.index_of(frame)?;
        Some(if self.bitmap.test(index) {
            FrameState::Used
        } else {
            FrameState::Free
        })
    }

    /// Allocate the lowest free frame.
    ///
    /// # Errors
    /// [`FrameError::OutOfMemory`] if every frame is used; nothing changes.
    pub fn allocate_frame(&mut self) -> Result<PhysicalFrame, FrameError> {
        let Some(index) = self.bitmap.first_clear(self.hint) else {
            self.hint = words_for(self.bitmap.len());
            warn!("frame allocator exhausted ({} frames)", self.total_frames());
            return Err(FrameError::OutOfMemory);
        };
        self.bitmap.set(index);
        self.free -= 1;
        self.hint = index / BITS_PER_WORD;
        let frame = self.frame_at(index);
        trace!("allocated frame {frame}");
        Ok(frame)
    }

    /// Allocate the lowest run of `count` physically contiguous frames.
    ///
    /// # Errors
    /// [`FrameError::EmptyRun`] for `count == 0`, [`FrameError::OutOfMemory`]
    /// if no run is long enough.
    pub fn allocate_contiguous(&mut self, count: usize) -> Result<PhysicalFrame, FrameError> {
        if count == 0 {
            return Err(FrameError::EmptyRun);
        }
        if count > self.free {
            return Err(FrameError::OutOfMemory);
        }
        let start = self.bitmap.find_clear_run(count).ok_or(FrameError::OutOfMemory)?;
        self.free -= self.bitmap.set_range(start, count);
        let frame = self.frame_at(start);
        trace!("allocated {count} contiguous frames at {frame}");
        Ok(frame)
    }

    /// Return `frame` to the pool.
    ///
    /// # Errors
    /// [`FrameError::OutOfRange`] for unmanaged frames, [`FrameError::DoubleFree`]
    /// if the frame is already free. The bitmap is unchanged in both cases.
    pub fn free_frame(&mut self, frame: PhysicalFrame) -> Result<(), FrameError> {
        let index = self.index_of(frame).ok_or(FrameError::OutOfRange(frame))?;
        if !self.bitmap.clear(index) {
            error!("double free of frame {frame}");
            return Err(FrameError::DoubleFree(frame));
        }
        self.free += 1;
        self.hint = self.hint.min(index / BITS_PER_WORD);
        trace!("freed frame {frame}");
        Ok(())
    }

    /// [`free_frame`](Self::free_frame) for a raw address.
    ///
    /// # Errors
    /// [`FrameError::Misaligned`] if `address` is not the start of a frame,
    /// otherwise as for [`free_frame`](Self::free_frame).
    pub fn free_address(&mut self, address: PhysicalAddress) -> Result<(), FrameError> {
        self.free_frame(PhysicalFrame::from_start_address(address)?)
    }

    /// Free a run obtained from [`allocate_contiguous`](Self::allocate_contiguous).
    ///
    /// The whole run is checked before any bit changes.
    ///
    /// # Errors
    /// As for [`free_frame`](Self::free_frame), reported for the first
    /// offending frame.
    pub fn free_contiguous(&mut self, start: PhysicalFrame, count: usize) -> Result<(), FrameError> {
        if count == 0 {
            return Err(FrameError::EmptyRun);
        }
        let first = self.index_of(start).ok_or(FrameError::OutOfRange(start))?;
        let last = start.add_frames(count as u64 - 1);
        self.index_of(last).ok_or(FrameError::OutOfRange(last))?;
        if let Some(offset) = (0..count).find(|i| !self.bitmap.test(first + i)) {
            let frame = start.add_frames(offset as u64);
            error!("double free of frame {frame} in run of {count} at {start}");
            return Err(FrameError::DoubleFree(frame));
        }
        self.free += self.bitmap.clear_range(first, count);
        self.hint = self.hint.min(first / BITS_PER_WORD);
        Ok(())
    }

    /// Mark every frame overlapping `start .. start + len` as used.
    ///
    /// Rounds outward and clamps to the managed range. Returns how many
    /// frames changed state.
    pub fn reserve_region(&mut self, start: PhysicalAddress, len: u64) -> usize {
        let end = start
            .as_u64()
            .saturating_add(len)
            .div_ceil(FRAME_SIZE)
            .saturating_mul(FRAME_SIZE);
        let Some((first, count)) = self.clamp(start.align_down(FRAME_SIZE), end) else {
            return 0;
        };
        let changed = self.bitmap.set_range(first, count);
        self.free -= changed;
        changed
    }

    /// Mark every frame fully inside `start .. start + len` as free.
    ///
    /// Rounds inward and clamps to the managed range. Returns how many
    /// frames changed state.
    pub fn release_region(&mut self, start: PhysicalAddress, len: u64) -> usize {
        let end = start.as_u64().saturating_add(len) / FRAME_SIZE * FRAME_SIZE;
        let Some((first, count)) = self.clamp(start.align_up(FRAME_SIZE), end) else {
            return 0;
        };
        let changed = self.bitmap.clear_range(first, count);
        self.free += changed;
        self.hint = self.hint.min(first / BITS_PER_WORD);
        changed
    }

    /// Bit range for the frame-aligned span `start .. end`, clipped to the managed frames.
    fn clamp(&self, start: PhysicalAddress, end: u64) -> Option<(usize, usize)> {
        let lo = start.as_u64().max(self.base.start_address().as_u64());
        let hi = end.min(self.end().start_address().as_u64());
        if lo >= hi {
            return None;
        }
        let first = usize::try_from((lo - self.base.start_address().as_u64()) / FRAME_SIZE).ok()?;
        let count = usize::try_from((hi - lo) / FRAME_SIZE).ok()?;
        Some((first, count))
    }
}

impl FrameAlloc for BitmapFrameAllocator<'_> {
    fn alloc_4k(&mut self) -> Option<PhysicalFrame> {
        self.allocate_frame().ok()
    }

    fn free_4k(&mut self, frame: PhysicalFrame) {
        if let Err(e) = self.free_frame(frame) {
            error!("page-table frame release failed: {e}");
        }
    }
}
