//! # Virtual Memory Support
//!
//! x86-64 four-level paging for the kernel: typed page-table entries, the
//! 4 KiB-aligned [`PageTable`] and the [`AddressSpace`] that maps, unmaps and
//! translates single 4 KiB pages.
//!
//! ## What you get
//! - [`PageTableEntry`]: a tagged view (`Absent` / `Table` / `Page` / `HugePage`)
//!   with an explicit encode/decode boundary to the hardware [`RawEntry`].
//! - [`PagePermissions`]: the leaf attributes callers choose.
//! - [`AddressSpace`]: map with rollback on table-allocation failure, unmap with
//!   reclamation of empty intermediate tables, translate, activate.
//! - The two seams the allocator side implements: [`FrameAlloc`] and [`PhysMapper`].
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! Each level is a 4 KiB table of 512 eight-byte entries. The CPU uses the
//! nine-bit fields as indices, top to bottom:
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//!   │        │        │        │
//!   │        │        │        └───► PTE   → maps 4 KiB page
//!   │        │        └────────────► PDE   → PS=1 → 2 MiB page
//!   │        └─────────────────────► PDPTE → PS=1 → 1 GiB page
//!   └──────────────────────────────► PML4E
//! ```
//!
//! This crate only ever *creates* 4 KiB leaves. Huge leaves installed by
//! someone else (e.g. the bootloader) are honoured by translation and reported
//! as conflicts by map/unmap.
//!
//! ## Live-entry counts
//!
//! Every entry pointing at a lower-level table records how many present
//! entries that table holds, in the entry's OS-available bits. Unmapping the
//! last page under a table frees the table and clears the entry pointing at
//! it, repeating upward. The root table is never freed.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

pub mod address_space;
mod entry;
mod table;

pub use crate::address_space::{AddressSpace, MapError, MapMode, UnmapError, UnmapMode};
pub use crate::entry::{PagePermissions, PageTableEntry, RawEntry};
pub use crate::table::{ENTRIES_PER_TABLE, PageTable, TableLevel};
pub use kernel_memory_addresses::{
    FRAME_SIZE, PhysicalAddress, PhysicalFrame, VirtualAddress, VirtualPage,
};

/// Source of **physical** 4 KiB frames for page tables.
///
/// The implementation decides where frames come from (bootstrap pool, bitmap,
/// etc.). Returned frames are 4 KiB-aligned by construction.
pub trait FrameAlloc {
    /// Allocate one frame, `None` on out-of-memory.
    fn alloc_4k(&mut self) -> Option<PhysicalFrame>;

    /// Return a frame obtained from [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&mut self, frame: PhysicalFrame);
}

impl<A: FrameAlloc + ?Sized> FrameAlloc for &mut A {
    #[inline]
    fn alloc_4k(&mut self) -> Option<PhysicalFrame> {
        (**self).alloc_4k()
    }

    #[inline]
    fn free_4k(&mut self, frame: PhysicalFrame) {
        (**self).free_4k(frame);
    }
}

/// Converts physical addresses to usable pointers in the current virtual
/// address space (identity map at early boot, HHDM in the kernel).
pub trait PhysMapper {
    /// Borrow the `T` stored at physical address `pa`.
    ///
    /// # Safety
    /// - `pa` must be mapped writable in the current page tables.
    /// - The mapping must stay valid for `'a`, and no other reference to the
    ///   same bytes may be live while the returned one is used.
    /// - `T` must match the bytes at `pa`.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;

    /// Fill `frame` with zeroes.
    ///
    /// # Safety
    /// Same as [`phys_to_mut`](Self::phys_to_mut); nothing else may be
    /// referencing the frame.
    unsafe fn zero_frame(&self, frame: PhysicalFrame) {
        let bytes = unsafe { self.phys_to_mut::<[u8; FRAME_SIZE as usize]>(frame.start_address()) };
        bytes.fill(0);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::cell::UnsafeCell;
    use std::collections::BTreeSet;

    /// A 4 KiB-aligned raw frame used as simulated RAM.
    #[repr(align(4096))]
    pub struct Aligned4K(pub [u8; 4096]);

    /// Simulated physical memory: physical address `n * 4096` is frame `n`.
    pub struct TestPhys {
        frames: Vec<UnsafeCell<Aligned4K>>,
    }

    impl TestPhys {
        pub fn with_frames(n: usize) -> Self {
            Self {
                frames: (0..n).map(|_| UnsafeCell::new(Aligned4K([0; 4096]))).collect(),
            }
        }
    }

    impl PhysMapper for TestPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            let idx = usize::try_from(pa.as_u64() >> 12).unwrap();
            let off = usize::try_from(pa.frame_offset()).unwrap();
            let base = self.frames[idx].get().cast::<u8>();
            unsafe { &mut *base.add(off).cast::<T>() }
        }
    }

    /// Lowest-first frame pool with an optional budget to force OOM.
    pub struct TestFrames {
        free: BTreeSet<u64>,
        pub outstanding: BTreeSet<u64>,
        pub budget: Option<usize>,
    }

    impl TestFrames {
        /// Frames `first..end` are available.
        pub fn new(first: u64, end: u64) -> Self {
            Self {
                free: (first..end).collect(),
                outstanding: BTreeSet::new(),
                budget: None,
            }
        }
    }

    impl FrameAlloc for TestFrames {
        fn alloc_4k(&mut self) -> Option<PhysicalFrame> {
            if let Some(b) = self.budget.as_mut() {
                if *b == 0 {
                    return None;
                }
                *b -= 1;
            }
            let n = self.free.pop_first()?;
            self.outstanding.insert(n);
            Some(PhysicalFrame::from_number(n))
        }

        fn free_4k(&mut self, frame: PhysicalFrame) {
            assert!(self.outstanding.remove(&frame.number()), "foreign free {frame:?}");
            self.free.insert(frame.number());
        }
    }
}
