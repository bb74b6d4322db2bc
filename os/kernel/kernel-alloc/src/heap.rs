//! # Kernel Heap
//!
//! First-fit allocator over one contiguous virtual window
//! `start .. start + max_size`. Only the prefix `start .. start + mapped` is
//! backed by frames; the rest is mapped on demand through a [`HeapBacking`].
//!
//! ## Layout
//!
//! ```text
//!  start                                                start + mapped
//!   │ hdr │ payload (Used) │ hdr │ payload (Free)     │ hdr │ payload │
//!   └─16─┘                 └─16─┘                     └─16─┘
//! ```
//!
//! Every block is a 16-byte header slot followed by its payload, and blocks
//! tile the mapped prefix with no gaps: `block.start + HEADER_SIZE + block.size`
//! is the next block's `start`. Payload addresses are 16-byte aligned; a
//! stricter alignment splits a free pad block off the front of the chosen block.
//!
//! ## Block bookkeeping
//!
//! Block descriptors do not live in the heap memory. They sit in a
//! fixed-capacity arena of slots addressed by [`BlockId`], linked in address
//! order through `prev`/`next` indices. Vacated slots go on a free-slot list
//! and are reused. The header slot in memory is never written.
//!
//! ## Invariants
//!
//! - Blocks are ordered by address and tile `start .. start + mapped`.
//! - No two adjacent blocks are both free.
//! - Freeing merges with the next block first, then with the previous one.

use arrayvec::ArrayVec;
use core::fmt;
use kernel_info::memory::KERNEL_HEAP_BLOCK_SLOTS;
use kernel_memory_addresses::{FRAME_SIZE, VirtualAddress, checked_align_up};
use log::{debug, error, trace, warn};

/// Alignment of every payload address and granularity of every block size.
pub const HEAP_ALIGN: u64 = 16;

/// Bytes reserved in front of every payload.
pub const HEADER_SIZE: u64 = 16;

/// Smallest payload a split-off remainder may have.
pub const MIN_SPLIT_PAYLOAD: u64 = 16;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BlockStatus {
    Free,
    Used,
}

/// Index of a block descriptor in the heap's arena.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BlockId(u16);

impl BlockId {
    #[inline]
    const fn index(self) -> usize {
        self.0 as usize
    }
}

/// One block of the heap, as recorded in the arena.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HeapBlock {
    /// Address of the header slot.
    pub start: VirtualAddress,
    /// Payload bytes, header excluded.
    pub size: u64,
    pub status: BlockStatus,
    prev: Option<BlockId>,
    next: Option<BlockId>,
}

impl HeapBlock {
    /// First payload byte; what callers receive.
    #[inline]
    #[must_use]
    pub const fn payload(&self) -> VirtualAddress {
        VirtualAddress::new(self.start.as_u64() + HEADER_SIZE)
    }

    /// One past the last payload byte.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.start.as_u64() + HEADER_SIZE + self.size)
    }

    #[inline]
    #[must_use]
    pub const fn is_free(&self) -> bool {
        matches!(self.status, BlockStatus::Free)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapError {
    #[error("heap exhausted")]
    OutOfMemory,
    #[error("{0} was not handed out by this heap")]
    InvalidPointer(VirtualAddress),
    #[error("{0} is already free")]
    DoubleFree(VirtualAddress),
    #[error("heap is already initialized")]
    AlreadyInitialized,
    #[error("could not back heap pages with frames")]
    Backing,
    #[error("heap bookkeeping is inconsistent at {0}")]
    Corrupted(VirtualAddress),
    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(usize),
}

/// Supplies memory behind the heap window.
pub trait HeapBacking {
    /// Make the page-aligned range `start .. start + bytes` readable and writable.
    ///
    /// # Errors
    /// [`HeapError::OutOfMemory`] if no frames are left, [`HeapError::Backing`]
    /// for any other mapping failure. Nothing may stay mapped on error.
    fn back(&mut self, start: VirtualAddress, bytes: u64) -> Result<(), HeapError>;
}

impl<B: HeapBacking + ?Sized> HeapBacking for &mut B {
    #[inline]
    fn back(&mut self, start: VirtualAddress, bytes: u64) -> Result<(), HeapError> {
        (**self).back(start, bytes)
    }
}

/// First-fit, coalescing heap tracking up to `N` blocks.
pub struct HeapAllocator<const N: usize = KERNEL_HEAP_BLOCK_SLOTS> {
    slots: ArrayVec<HeapBlock, N>,
    vacant: ArrayVec<BlockId, N>,
    head: Option<BlockId>,
    tail: Option<BlockId>,
    start: VirtualAddress,
    mapped: u64,
    max_size: u64,
    initialized: bool,
}

impl<const N: usize> HeapAllocator<N> {
    /// An empty heap over `start .. start + max_size`. Nothing is mapped yet.
    #[must_use]
    pub const fn new(start: VirtualAddress, max_size: u64) -> Self {
        Self {
            slots: ArrayVec::new_const(),
            vacant: ArrayVec::new_const(),
            head: None,
            tail: None,
            start,
            mapped: 0,
            max_size,
            initialized: false,
        }
    }

    /// Back the first `initial_size` bytes (rounded up to whole pages) and
    /// turn them into one free block.
    ///
    /// # Errors
    /// [`HeapError::AlreadyInitialized`] on a second call,
    /// [`HeapError::OutOfMemory`] if `initial_size` exceeds the window,
    /// and whatever the backing reports.
    pub fn init(&mut self, backing: &mut impl HeapBacking, initial_size: u64) -> Result<(), HeapError> {
        if self.initialized {
            return Err(HeapError::AlreadyInitialized);
        }
        let bytes = checked_align_up(initial_size, FRAME_SIZE).ok_or(HeapError::OutOfMemory)?;
        if bytes > self.max_size {
            return Err(HeapError::OutOfMemory);
        }
        if bytes > 0 {
            self.extend(backing, bytes)?;
        }
        self.initialized = true;
        debug!(
            "heap at {} ready: {bytes} bytes mapped, {} max",
            self.start, self.max_size
        );
        Ok(())
    }

    #[inline]
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    #[inline]
    #[must_use]
    pub const fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Bytes of the window currently backed by frames.
    #[inline]
    #[must_use]
    pub const fn mapped_size(&self) -> u64 {
        self.mapped
    }

    /// Whether `va` lies inside the heap window, mapped or not.
    #[inline]
    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        va.as_u64() >= self.start.as_u64() && va.as_u64() - self.start.as_u64() < self.max_size
    }

    /// Allocate `size` bytes, growing the mapped prefix if nothing fits.
    ///
    /// `size` is rounded up to [`HEAP_ALIGN`]; zero is allowed and still yields
    /// a unique address.
    ///
    /// # Errors
    /// [`HeapError::OutOfMemory`] if `size` exceeds `max_size`, growing would
    /// pass `max_size`, the arena is full, or the backing ran out of frames.
    /// The heap is unchanged.
    pub fn allocate(&mut self, size: usize, backing: &mut impl HeapBacking) -> Result<VirtualAddress, HeapError> {
        self.place(size, HEAP_ALIGN, backing)
    }

    /// Like [`allocate`](Self::allocate), with the payload aligned to `align`.
    ///
    /// Alignments up to [`HEAP_ALIGN`] cost nothing extra. Larger ones may
    /// split a free pad block off the front of the chosen block; it stays
    /// available to later requests.
    ///
    /// # Errors
    /// [`HeapError::InvalidAlignment`] if `align` is not a power of two,
    /// otherwise as [`allocate`](Self::allocate).
    pub fn allocate_aligned(
        &mut self,
        size: usize,
        align: usize,
        backing: &mut impl HeapBacking,
    ) -> Result<VirtualAddress, HeapError> {
        let align = u64::try_from(align)
            .ok()
            .filter(|a| a.is_power_of_two())
            .ok_or(HeapError::InvalidAlignment(align))?;
        self.place(size, align.max(HEAP_ALIGN), backing)
    }

    fn place(&mut self, size: usize, align: u64, backing: &mut impl HeapBacking) -> Result<VirtualAddress, HeapError> {
        let size = u64::try_from(size)
            .ok()
            .filter(|s| *s <= self.max_size)
            .and_then(|s| checked_align_up(s, HEAP_ALIGN))
            .ok_or_else(|| {
                warn!("heap: {size} bytes exceed the {} byte window", self.max_size);
                HeapError::OutOfMemory
            })?;

        let (id, pad) = match self.first_fit(size, align) {
            Some(fit) => fit,
            None => {
                // Worst case the payload moves past a minimal pad block and
                // up to one alignment unit further.
                let slack = if align > HEAP_ALIGN {
                    align.checked_add(HEADER_SIZE + MIN_SPLIT_PAYLOAD)
                } else {
                    Some(0)
                };
                let needed = slack
                    .and_then(|slack| size.checked_add(slack))
                    .ok_or(HeapError::OutOfMemory)?;
                self.grow(needed, backing)?;
                self.first_fit(size, align).ok_or(HeapError::OutOfMemory)?
            }
        };
        let id = self.split_front(id, pad).ok_or(HeapError::OutOfMemory)?;
        let payload = self.take(id, size);
        trace!("heap: {size} bytes at {payload}");
        Ok(payload)
    }

    /// Release the allocation at `pointer`, coalescing with free neighbours.
    ///
    /// # Errors
    /// [`HeapError::InvalidPointer`] if `pointer` is not the payload address of
    /// a block, [`HeapError::DoubleFree`] if that block is already free. The
    /// heap is unchanged in both cases.
    pub fn free(&mut self, pointer: VirtualAddress) -> Result<(), HeapError> {
        let Some(id) = self.block_at(pointer) else {
            warn!("heap: free of foreign pointer {pointer}");
            return Err(HeapError::InvalidPointer(pointer));
        };
        if self.slot(id).is_free() {
            error!("heap: double free of {pointer}");
            return Err(HeapError::DoubleFree(pointer));
        }
        self.slot_mut(id).status = BlockStatus::Free;
        trace!("heap: freed {} bytes at {pointer}", self.slot(id).size);

        if let Some(next) = self.slot(id).next
            && self.slot(next).is_free()
        {
            self.absorb_next(id);
        }
        if let Some(prev) = self.slot(id).prev
            && self.slot(prev).is_free()
        {
            self.absorb_next(prev);
        }
        Ok(())
    }

    /// Total payload bytes in free blocks.
    #[must_use]
    pub fn free_capacity(&self) -> u64 {
        self.blocks().filter(HeapBlock::is_free).map(|b| b.size).sum()
    }

    /// Total payload bytes in used blocks, including split-off slack.
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.blocks().filter(|b| !b.is_free()).map(|b| b.size).sum()
    }

    #[inline]
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.slots.len() - self.vacant.len()
    }

    /// Blocks in address order.
    #[must_use]
    pub const fn blocks(&self) -> Blocks<'_, N> {
        Blocks {
            heap: self,
            cursor: self.head,
        }
    }

    /// Check ordering, tiling and coalescing of the block list.
    ///
    /// # Errors
    /// [`HeapError::Corrupted`] with the address where the first violation was found.
    pub fn validate(&self) -> Result<(), HeapError> {
        let mut expected = self.start;
        let mut previous: Option<BlockId> = None;
        let mut seen = 0;
        let mut cursor = self.head;
        while let Some(id) = cursor {
            let block = self.slot(id);
            let broken = block.start != expected
                || block.prev != previous
                || !block.payload().is_aligned(HEAP_ALIGN)
                || previous.is_some_and(|p| self.slot(p).is_free() && block.is_free());
            if broken || seen == self.block_count() {
                return Err(HeapError::Corrupted(block.start));
            }
            seen += 1;
            expected = block.end();
            previous = Some(id);
            cursor = block.next;
        }
        if previous != self.tail || seen != self.block_count() || expected != self.start + self.mapped {
            return Err(HeapError::Corrupted(expected));
        }
        Ok(())
    }

    #[inline]
    fn slot(&self, id: BlockId) -> &HeapBlock {
        &self.slots[id.index()]
    }

    #[inline]
    fn slot_mut(&mut self, id: BlockId) -> &mut HeapBlock {
        &mut self.slots[id.index()]
    }

    #[inline]
    fn has_vacant_slot(&self) -> bool {
        !self.vacant.is_empty() || !self.slots.is_full()
    }

    fn alloc_slot(&mut self, block: HeapBlock) -> Option<BlockId> {
        if let Some(id) = self.vacant.pop() {
            *self.slot_mut(id) = block;
            return Some(id);
        }
        let id = BlockId(u16::try_from(self.slots.len()).ok()?);
        self.slots.try_push(block).ok()?;
        Some(id)
    }

    fn release_slot(&mut self, id: BlockId) {
        self.vacant.push(id);
    }

    /// First free block holding `size` bytes at an `align`-aligned payload,
    /// with the pad its payload has to move by.
    fn first_fit(&self, size: u64, align: u64) -> Option<(BlockId, u64)> {
        let mut cursor = self.head;
        while let Some(id) = cursor {
            let block = self.slot(id);
            if block.is_free()
                && let Some(pad) = self.leading_pad(block, align)
                && block.size.checked_sub(pad).is_some_and(|rest| rest >= size)
            {
                return Some((id, pad));
            }
            cursor = block.next;
        }
        None
    }

    /// Bytes to skip at the front of `block` for an `align`-aligned payload.
    ///
    /// A non-zero pad always has room for a header and [`MIN_SPLIT_PAYLOAD`],
    /// and needs a vacant slot to become a block of its own.
    fn leading_pad(&self, block: &HeapBlock, align: u64) -> Option<u64> {
        let payload = block.payload();
        if payload.is_aligned(align) {
            return Some(0);
        }
        if !self.has_vacant_slot() {
            return None;
        }
        let earliest = payload.as_u64().checked_add(HEADER_SIZE + MIN_SPLIT_PAYLOAD)?;
        Some(checked_align_up(earliest, align)? - payload.as_u64())
    }

    /// The block whose payload starts at `pointer`.
    fn block_at(&self, pointer: VirtualAddress) -> Option<BlockId> {
        let header = pointer.as_u64().checked_sub(HEADER_SIZE)?;
        if !pointer.is_aligned(HEAP_ALIGN)
            || header < self.start.as_u64()
            || header >= self.start.as_u64() + self.mapped
        {
            return None;
        }
        let mut cursor = self.head;
        while let Some(id) = cursor {
            let block = self.slot(id);
            match block.start.as_u64().cmp(&header) {
                core::cmp::Ordering::Equal => return Some(id),
                core::cmp::Ordering::Greater => return None,
                core::cmp::Ordering::Less => cursor = block.next,
            }
        }
        None
    }

    /// Turn the first `pad` bytes of the free block `id` into a free block of
    /// their own and return the remainder.
    fn split_front(&mut self, id: BlockId, pad: u64) -> Option<BlockId> {
        if pad == 0 {
            return Some(id);
        }
        let block = *self.slot(id);
        let rest = HeapBlock {
            start: block.start + pad,
            size: block.size - pad,
            status: BlockStatus::Free,
            prev: Some(id),
            next: block.next,
        };
        let rest_id = self.alloc_slot(rest)?;
        match block.next {
            Some(next) => self.slot_mut(next).prev = Some(rest_id),
            None => self.tail = Some(rest_id),
        }
        let front = self.slot_mut(id);
        front.next = Some(rest_id);
        front.size = pad - HEADER_SIZE;
        Some(rest_id)
    }

    /// Mark the free block `id` used, splitting off the tail if it is large enough.
    fn take(&mut self, id: BlockId, size: u64) -> VirtualAddress {
        let block = *self.slot(id);
        if block.size >= size + HEADER_SIZE + MIN_SPLIT_PAYLOAD {
            let rest = HeapBlock {
                start: block.payload() + size,
                size: block.size - size - HEADER_SIZE,
                status: BlockStatus::Free,
                prev: Some(id),
                next: block.next,
            };
            if let Some(rest_id) = self.alloc_slot(rest) {
                match block.next {
                    Some(next) => self.slot_mut(next).prev = Some(rest_id),
                    None => self.tail = Some(rest_id),
                }
                let used = self.slot_mut(id);
                used.next = Some(rest_id);
                used.size = size;
            }
        }
        self.slot_mut(id).status = BlockStatus::Used;
        block.payload()
    }

    /// Merge the block after `id` into `id`.
    fn absorb_next(&mut self, id: BlockId) {
        let Some(next) = self.slot(id).next else {
            return;
        };
        let absorbed = *self.slot(next);
        let block = self.slot_mut(id);
        block.size += HEADER_SIZE + absorbed.size;
        block.next = absorbed.next;
        match absorbed.next {
            Some(after) => self.slot_mut(after).prev = Some(id),
            None => self.tail = Some(id),
        }
        self.release_slot(next);
    }

    /// Map enough whole pages past the end for a `size`-byte block to fit.
    fn grow(&mut self, size: u64, backing: &mut impl HeapBacking) -> Result<(), HeapError> {
        let trailing_free = self.tail.map(|t| *self.slot(t)).filter(HeapBlock::is_free);
        let needed = match trailing_free {
            Some(tail) => size.saturating_sub(tail.size),
            None => size.checked_add(HEADER_SIZE).ok_or(HeapError::OutOfMemory)?,
        };
        let bytes = checked_align_up(needed, FRAME_SIZE).ok_or(HeapError::OutOfMemory)?;
        if self.mapped.checked_add(bytes).is_none_or(|end| end > self.max_size) {
            warn!(
                "heap: cannot grow by {bytes} bytes, {} of {} mapped",
                self.mapped, self.max_size
            );
            return Err(HeapError::OutOfMemory);
        }
        self.extend(backing, bytes)?;
        debug!("heap: grew by {bytes} bytes to {}", self.mapped);
        Ok(())
    }

    /// Back `bytes` more at the end and add them to the trailing free block
    /// or a new one.
    fn extend(&mut self, backing: &mut impl HeapBacking, bytes: u64) -> Result<(), HeapError> {
        let at = self.start + self.mapped;
        let trailing_free = self.tail.filter(|t| self.slot(*t).is_free());
        if trailing_free.is_none() && !self.has_vacant_slot() {
            warn!("heap: block arena full ({N} slots)");
            return Err(HeapError::OutOfMemory);
        }
        backing.back(at, bytes)?;
        self.mapped += bytes;

        if let Some(tail) = trailing_free {
            self.slot_mut(tail).size += bytes;
            return Ok(());
        }
        let block = HeapBlock {
            start: at,
            size: bytes - HEADER_SIZE,
            status: BlockStatus::Free,
            prev: self.tail,
            next: None,
        };
        let id = self.alloc_slot(block).ok_or(HeapError::OutOfMemory)?;
        match self.tail {
            Some(tail) => self.slot_mut(tail).next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        Ok(())
    }
}

impl<const N: usize> fmt::Debug for HeapAllocator<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapAllocator")
            .field("start", &self.start)
            .field("mapped", &self.mapped)
            .field("max_size", &self.max_size)
            .field("blocks", &self.block_count())
            .finish_non_exhaustive()
    }
}

/// Iterator over the blocks of a [`HeapAllocator`] in address order.
pub struct Blocks<'a, const N: usize> {
    heap: &'a HeapAllocator<N>,
    cursor: Option<BlockId>,
}

impl<const N: usize> Iterator for Blocks<'_, N> {
    type Item = HeapBlock;

    fn next(&mut self) -> Option<Self::Item> {
        let block = *self.heap.slot(self.cursor?);
        self.cursor = block.next;
        Some(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEAP: u64 = 0xffff_c000_0000_0000;

    #[derive(Default)]
    struct RecordingBacking {
        calls: Vec<(u64, u64)>,
        fail_with: Option<HeapError>,
    }

    impl HeapBacking for RecordingBacking {
        fn back(&mut self, start: VirtualAddress, bytes: u64) -> Result<(), HeapError> {
            if let Some(e) = self.fail_with {
                return Err(e);
            }
            self.calls.push((start.as_u64(), bytes));
            Ok(())
        }
    }

    fn heap(initial: u64, max: u64) -> (HeapAllocator, RecordingBacking) {
        let mut backing = RecordingBacking::default();
        let mut heap = HeapAllocator::new(VirtualAddress::new(HEAP), max);
        heap.init(&mut backing, initial).unwrap();
        (heap, backing)
    }

    fn sizes<const N: usize>(heap: &HeapAllocator<N>) -> Vec<(u64, BlockStatus)> {
        heap.blocks().map(|b| (b.size, b.status)).collect()
    }

    #[test]
    fn init_maps_whole_pages_as_one_free_block() {
        let (heap, backing) = heap(10_000, 0x1_0000);
        assert_eq!(backing.calls, vec![(HEAP, 0x3000)]);
        assert_eq!(heap.mapped_size(), 0x3000);
        assert_eq!(sizes(&heap), vec![(0x3000 - HEADER_SIZE, BlockStatus::Free)]);
        assert!(heap.validate().is_ok());
    }

    #[test]
    fn second_init_is_rejected() {
        let (mut heap, mut backing) = heap(4096, 0x1_0000);
        assert_eq!(heap.init(&mut backing, 4096), Err(HeapError::AlreadyInitialized));
        assert_eq!(heap.mapped_size(), 4096);
    }

    #[test]
    fn split_produces_exact_sizes() {
        let (mut heap, mut backing) = heap(0x3000, 0x1_0000);
        let a = heap.allocate(100, &mut backing).unwrap();
        assert_eq!(a.as_u64(), HEAP + HEADER_SIZE);
        assert_eq!(
            sizes(&heap),
            vec![
                (112, BlockStatus::Used),
                (0x3000 - HEADER_SIZE - 112 - HEADER_SIZE, BlockStatus::Free),
            ]
        );
        let b = heap.allocate(1, &mut backing).unwrap();
        assert_eq!(b.as_u64(), HEAP + HEADER_SIZE + 112 + HEADER_SIZE);
        assert!(b.is_aligned(HEAP_ALIGN));
        assert!(heap.validate().is_ok());
    }

    #[test]
    fn small_remainder_is_not_split_off() {
        let (mut heap, mut backing) = heap(4096, 0x1_0000);
        heap.allocate(4064, &mut backing).unwrap();
        assert_eq!(sizes(&heap), vec![(4080, BlockStatus::Used)]);
        assert_eq!(heap.used_bytes(), 4080);
        assert_eq!(heap.free_capacity(), 0);
    }

    #[test]
    fn free_restores_capacity_in_any_order() {
        for order in [[0, 1, 2], [1, 0, 2], [2, 0, 1], [0, 2, 1]] {
            let (mut heap, mut backing) = heap(0x2000, 0x1_0000);
            let before = heap.free_capacity();
            let ptrs = [
                heap.allocate(24, &mut backing).unwrap(),
                heap.allocate(256, &mut backing).unwrap(),
                heap.allocate(48, &mut backing).unwrap(),
            ];
            assert!(heap.free_capacity() < before);
            for i in order {
                heap.free(ptrs[i]).unwrap();
                assert!(heap.validate().is_ok());
            }
            assert_eq!(heap.block_count(), 1);
            assert_eq!(heap.free_capacity(), before);
        }
    }

    #[test]
    fn free_merges_next_then_previous() {
        let (mut heap, mut backing) = heap(0x2000, 0x1_0000);
        let a = heap.allocate(32, &mut backing).unwrap();
        let b = heap.allocate(32, &mut backing).unwrap();
        let c = heap.allocate(32, &mut backing).unwrap();
        let _d = heap.allocate(32, &mut backing).unwrap();
        heap.free(a).unwrap();
        heap.free(c).unwrap();
        assert_eq!(heap.block_count(), 5);
        heap.free(b).unwrap();
        assert_eq!(
            sizes(&heap)[..2],
            [(32 * 3 + HEADER_SIZE * 2, BlockStatus::Free), (32, BlockStatus::Used)]
        );
        assert_eq!(heap.block_count(), 3);
        // The merged block starts where `a` did and is reused first.
        assert_eq!(heap.allocate(64, &mut backing), Ok(a));
    }

    #[test]
    fn zero_sized_allocations_are_distinct() {
        let (mut heap, mut backing) = heap(4096, 0x1_0000);
        let p = heap.allocate(0, &mut backing).unwrap();
        let q = heap.allocate(0, &mut backing).unwrap();
        assert_ne!(p, q);
        assert!(p.is_aligned(HEAP_ALIGN) && q.is_aligned(HEAP_ALIGN));
        heap.free(q).unwrap();
        heap.free(p).unwrap();
        assert_eq!(heap.block_count(), 1);
    }

    #[test]
    fn growth_extends_the_trailing_free_block() {
        let (mut heap, mut backing) = heap(4096, 0x1_0000);
        let p = heap.allocate(5000, &mut backing).unwrap();
        assert_eq!(p.as_u64(), HEAP + HEADER_SIZE);
        assert_eq!(backing.calls, vec![(HEAP, 4096), (HEAP + 4096, 4096)]);
        assert_eq!(heap.mapped_size(), 8192);
        assert_eq!(
            sizes(&heap),
            vec![(5008, BlockStatus::Used), (8192 - 16 - 5008 - 16, BlockStatus::Free)]
        );
    }

    #[test]
    fn growth_after_a_used_tail_appends_a_block() {
        let (mut heap, mut backing) = heap(4096, 0x1_0000);
        heap.allocate(4064, &mut backing).unwrap();
        let p = heap.allocate(0, &mut backing).unwrap();
        assert_eq!(p.as_u64(), HEAP + 4096 + HEADER_SIZE);
        assert_eq!(
            sizes(&heap),
            vec![
                (4080, BlockStatus::Used),
                (0, BlockStatus::Used),
                (4096 - 2 * HEADER_SIZE, BlockStatus::Free),
            ]
        );
        assert!(heap.validate().is_ok());
    }

    #[test]
    fn growth_past_max_size_fails_without_side_effects() {
        let (mut heap, mut backing) = heap(4096, 8192);
        assert_eq!(heap.allocate(9000, &mut backing), Err(HeapError::OutOfMemory));
        assert_eq!(backing.calls.len(), 1);
        assert_eq!(heap.mapped_size(), 4096);
        assert_eq!(heap.free_capacity(), 4080);
        assert!(heap.allocate(8000, &mut backing).is_ok());
        assert_eq!(heap.mapped_size(), 8192);
    }

    #[test]
    fn oversized_requests_fail_without_side_effects() {
        let (mut heap, mut backing) = heap(4096, 0x1_0000);
        heap.allocate(4064, &mut backing).unwrap();
        assert_eq!(heap.allocate(usize::MAX - 15, &mut backing), Err(HeapError::OutOfMemory));
        assert_eq!(heap.allocate(0x1_0001, &mut backing), Err(HeapError::OutOfMemory));
        assert_eq!(heap.mapped_size(), 4096);
        assert_eq!(backing.calls.len(), 1);
        assert!(heap.validate().is_ok());

        // An unbounded window still refuses sizes whose header would overflow.
        let mut backing = RecordingBacking::default();
        let mut unbounded: HeapAllocator = HeapAllocator::new(VirtualAddress::new(HEAP), u64::MAX);
        assert_eq!(
            unbounded.allocate(usize::MAX - 15, &mut backing),
            Err(HeapError::OutOfMemory)
        );
        assert!(backing.calls.is_empty());
        assert_eq!(unbounded.mapped_size(), 0);
    }

    #[test]
    fn page_alignment_splits_off_a_free_pad() {
        let (mut heap, mut backing) = heap(0x4000, 0x1_0000);
        let small = heap.allocate(64, &mut backing).unwrap();
        let p = heap.allocate_aligned(100, 4096, &mut backing).unwrap();
        assert_eq!(p.as_u64(), HEAP + 4096);
        assert_eq!(
            sizes(&heap),
            vec![
                (64, BlockStatus::Used),
                (4096 - 80 - 2 * HEADER_SIZE, BlockStatus::Free),
                (112, BlockStatus::Used),
                (0x4000 - 4096 - 112 - HEADER_SIZE, BlockStatus::Free),
            ]
        );
        assert!(heap.validate().is_ok());

        // The pad serves ordinary requests.
        let q = heap.allocate(256, &mut backing).unwrap();
        assert_eq!(q.as_u64(), HEAP + 96);

        heap.free(q).unwrap();
        heap.free(p).unwrap();
        assert_eq!(sizes(&heap), vec![(64, BlockStatus::Used), (0x4000 - 96, BlockStatus::Free)]);
        heap.free(small).unwrap();
        assert_eq!(heap.free_capacity(), 0x4000 - HEADER_SIZE);
        assert!(heap.validate().is_ok());
    }

    #[test]
    fn aligned_growth_reserves_room_for_the_pad() {
        let (mut heap, mut backing) = heap(4096, 0x1_0000);
        heap.allocate(4064, &mut backing).unwrap();
        let p = heap.allocate_aligned(8, 4096, &mut backing).unwrap();
        assert_eq!(p.as_u64(), HEAP + 0x2000);
        assert_eq!(backing.calls, vec![(HEAP, 4096), (HEAP + 4096, 0x2000)]);
        assert_eq!(
            sizes(&heap),
            vec![
                (4080, BlockStatus::Used),
                (4096 - 2 * HEADER_SIZE, BlockStatus::Free),
                (16, BlockStatus::Used),
                (4096 - 2 * HEADER_SIZE, BlockStatus::Free),
            ]
        );
        assert!(heap.validate().is_ok());
    }

    #[test]
    fn aligned_payloads_need_no_pad_when_already_aligned() {
        let (mut heap, mut backing) = heap(4096, 0x1_0000);
        // The first payload sits at HEAP + 16.
        assert_eq!(heap.allocate_aligned(32, 16, &mut backing), Ok(VirtualAddress::new(HEAP + 16)));
        assert_eq!(heap.allocate_aligned(32, 1, &mut backing), Ok(VirtualAddress::new(HEAP + 64)));
        assert_eq!(heap.block_count(), 3);
        assert_eq!(
            heap.allocate_aligned(32, 24, &mut backing),
            Err(HeapError::InvalidAlignment(24))
        );
        assert_eq!(
            heap.allocate_aligned(32, 0, &mut backing),
            Err(HeapError::InvalidAlignment(0))
        );
        assert_eq!(heap.block_count(), 3);
    }

    #[test]
    fn backing_failure_is_propagated() {
        let (mut heap, mut backing) = heap(4096, 0x1_0000);
        backing.fail_with = Some(HeapError::OutOfMemory);
        assert_eq!(heap.allocate(5000, &mut backing), Err(HeapError::OutOfMemory));
        assert_eq!(heap.mapped_size(), 4096);
        assert!(heap.validate().is_ok());
    }

    #[test]
    fn foreign_pointers_are_rejected() {
        let (mut heap, mut backing) = heap(4096, 0x1_0000);
        let p = heap.allocate(64, &mut backing).unwrap();
        for bad in [
            VirtualAddress::new(HEAP),
            VirtualAddress::new(HEAP + 8),
            p + 16,
            VirtualAddress::new(HEAP + 0x10_0000),
            VirtualAddress::new(8),
        ] {
            assert_eq!(heap.free(bad), Err(HeapError::InvalidPointer(bad)));
        }
        assert_eq!(heap.used_bytes(), 64);
    }

    #[test]
    fn double_free_is_detected() {
        let (mut heap, mut backing) = heap(4096, 0x1_0000);
        let p = heap.allocate(64, &mut backing).unwrap();
        let _q = heap.allocate(64, &mut backing).unwrap();
        heap.free(p).unwrap();
        assert_eq!(heap.free(p), Err(HeapError::DoubleFree(p)));
        assert!(heap.validate().is_ok());
    }

    #[test]
    fn full_arena_degrades_to_whole_block_reuse() {
        let mut backing = RecordingBacking::default();
        let mut heap = HeapAllocator::<4>::new(VirtualAddress::new(HEAP), 0x1_0000);
        heap.init(&mut backing, 4096).unwrap();
        let ptrs: Vec<_> = (0..3).map(|_| heap.allocate(16, &mut backing).unwrap()).collect();
        assert_eq!(heap.block_count(), 4);

        // No slot left to split: the remainder is handed out whole.
        heap.allocate(16, &mut backing).unwrap();
        assert_eq!(heap.free_capacity(), 0);
        assert_eq!(heap.allocate(16, &mut backing), Err(HeapError::OutOfMemory));
        assert_eq!(backing.calls.len(), 1);

        heap.free(ptrs[1]).unwrap();
        assert_eq!(heap.allocate(16, &mut backing), Ok(ptrs[1]));
    }

    #[test]
    fn lazy_heap_grows_on_first_allocation() {
        let mut backing = RecordingBacking::default();
        let mut heap: HeapAllocator = HeapAllocator::new(VirtualAddress::new(HEAP), 0x1_0000);
        assert!(!heap.is_initialized());
        let p = heap.allocate(32, &mut backing).unwrap();
        assert_eq!(p.as_u64(), HEAP + HEADER_SIZE);
        assert_eq!(backing.calls, vec![(HEAP, 4096)]);
        assert!(heap.contains(p));
        assert!(!heap.contains(VirtualAddress::new(HEAP + 0x1_0000)));
    }

    #[test]
    fn mixed_workload_keeps_invariants() {
        let (mut heap, mut backing) = heap(4096, 0x4_0000);
        let mut live = Vec::new();
        for round in 0..200u64 {
            let size = usize::try_from((round * 37) % 700).unwrap();
            live.push(heap.allocate(size, &mut backing).unwrap());
            if round % 3 == 2 {
                let victim = live.remove(usize::try_from(round % 5).unwrap() % live.len());
                heap.free(victim).unwrap();
            }
            heap.validate().unwrap();
        }
        for p in live {
            heap.free(p).unwrap();
        }
        assert_eq!(heap.block_count(), 1);
        assert_eq!(heap.free_capacity(), heap.mapped_size() - HEADER_SIZE);
    }
}
