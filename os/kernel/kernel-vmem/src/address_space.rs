//! # Address Space (x86-64, PML4-rooted)
//!
//! Build and manipulate one virtual address space: a tree of 4 KiB tables
//! rooted at a PML4 frame, reached through a [`PhysMapper`].
//!
//! ## Highlights
//!
//! - [`AddressSpace::map`] installs one 4 KiB leaf. Missing intermediate tables
//!   are reserved *before* anything is written, so running out of frames
//!   leaves the tree exactly as it was.
//! - [`AddressSpace::unmap`] clears one leaf and frees every intermediate
//!   table that became empty, bottom-up.
//! - [`AddressSpace::translate`] walks read-only and honours huge leaves.
//! - [`AddressSpace::activate`] loads CR3 with this space's root. Leaf changes
//!   made afterwards invalidate the affected TLB entry.
//!
//! ## Safety
//!
//! All `unsafe` is confined to turning a table frame into a `&mut PageTable`
//! through the mapper. The mapper must hand out writable views of every
//! table frame, and no two views of the same table are held at once.

use crate::entry::{PagePermissions, PageTableEntry};
use crate::table::{PageTable, TableLevel};
use crate::{FrameAlloc, PhysMapper};
use arrayvec::ArrayVec;
use kernel_memory_addresses::{
    AddressError, PhysicalAddress, PhysicalFrame, VirtualAddress, VirtualPage,
};
use log::{error, trace, warn};

/// What [`AddressSpace::map`] does when the page is already mapped.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MapMode {
    /// Fail with [`MapError::AlreadyMapped`].
    Insert,
    /// Overwrite the existing leaf.
    Replace,
}

/// What [`AddressSpace::unmap`] does with the frame the leaf referenced.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum UnmapMode {
    /// Hand it back to the caller, still allocated.
    KeepFrame,
    /// Return it to the frame allocator.
    ReleaseFrame,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error("{page} is already mapped to {frame}")]
    AlreadyMapped {
        page: VirtualPage,
        frame: PhysicalFrame,
    },
    #[error("no frame left for a new {level} table")]
    TableAllocation { level: TableLevel },
    #[error("{page} lies inside a huge {level} mapping")]
    HugePageConflict { page: VirtualPage, level: TableLevel },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum UnmapError {
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error("{0} is not mapped")]
    NotMapped(VirtualPage),
    #[error("{page} lies inside a huge {level} mapping")]
    HugePageConflict { page: VirtualPage, level: TableLevel },
}

/// Where a walk stopped.
enum Walk {
    /// Reached the PT; holds the path of `(table, index)` pairs, PML4 first.
    Complete([(PhysicalFrame, usize); 4]),
    /// The entry at `level` is absent.
    Missing { level: TableLevel },
    /// A huge leaf at `level` covers the address.
    Huge { level: TableLevel },
}

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysicalFrame,
    mapper: &'m M,
    active: bool,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Allocate and zero a fresh root table.
    ///
    /// # Errors
    /// [`MapError::TableAllocation`] if no frame is available.
    pub fn new<A: FrameAlloc + ?Sized>(mapper: &'m M, alloc: &mut A) -> Result<Self, MapError> {
        let root = alloc.alloc_4k().ok_or(MapError::TableAllocation {
            level: TableLevel::Pml4,
        })?;
        unsafe { mapper.zero_frame(root) };
        trace!("new address space, root table {root}");
        Ok(Self {
            root,
            mapper,
            active: false,
        })
    }

    /// Frame of the PML4.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalFrame {
        self.root
    }

    /// The mapper table frames are reached through.
    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }

    /// Whether [`activate`](Self::activate) was called on this handle.
    #[inline]
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// Load CR3 with this address space's root.
    ///
    /// # Safety
    /// The code and data being executed, the stack, and every table frame
    /// (through the mapper) must be mapped in this space.
    pub unsafe fn activate(&mut self) {
        #[cfg(target_arch = "x86_64")]
        {
            use kernel_registers::StoreRegisterUnsafe;
            use kernel_registers::cr3::Cr3;
            unsafe { Cr3::from_root_table(self.root).store_unsafe() };
        }
        self.active = true;
    }

    /// Borrow the table stored in `frame`.
    ///
    /// Callers keep at most one reference per frame alive.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    fn table(&self, frame: PhysicalFrame) -> &'m mut PageTable {
        unsafe { self.mapper.phys_to_mut::<PageTable>(frame.start_address()) }
    }

    fn walk(&self, va: VirtualAddress) -> Walk {
        let mut path = [(self.root, 0); 4];
        let mut frame = self.root;
        for (depth, level) in TableLevel::INTERMEDIATE.into_iter().enumerate() {
            let index = level.index_of(va);
            path[depth] = (frame, index);
            match self.table(frame).entry(index, level) {
                PageTableEntry::Table { frame: next, .. } => frame = next,
                PageTableEntry::Absent => return Walk::Missing { level },
                PageTableEntry::HugePage { .. } | PageTableEntry::Page { .. } => {
                    return Walk::Huge { level };
                }
            }
        }
        path[3] = (frame, TableLevel::Pt.index_of(va));
        Walk::Complete(path)
    }

    /// Add `delta` to the live count of the table referenced by `table[index]`.
    ///
    /// Returns the new count, or `None` if the entry is not a table link or the
    /// count would drop below zero. The entry is left untouched in that case.
    fn adjust_live(
        &self,
        (table, index): (PhysicalFrame, usize),
        level: TableLevel,
        delta: i32,
    ) -> Option<u16> {
        let t = self.table(table);
        let PageTableEntry::Table {
            frame,
            live_entries,
        } = t.entry(index, level)
        else {
            return None;
        };
        let Ok(live_entries) = u16::try_from(i32::from(live_entries) + delta) else {
            error!("live count of {level} entry {index} in {table} is corrupt ({live_entries} {delta:+})");
            return None;
        };
        t.set(
            index,
            PageTableEntry::Table {
                frame,
                live_entries,
            },
        );
        Some(live_entries)
    }

    /// Map the 4 KiB page at `virt` to the frame at `phys`.
    ///
    /// Returns the frame previously mapped there (only possible with
    /// [`MapMode::Replace`]).
    ///
    /// # Errors
    /// - [`MapError::Address`] if either address is not 4 KiB-aligned or `virt`
    ///   is not canonical. Nothing is installed.
    /// - [`MapError::AlreadyMapped`] in [`MapMode::Insert`] if a leaf exists.
    /// - [`MapError::TableAllocation`] if an intermediate table could not be
    ///   allocated. Frames reserved so far are returned, no entry is changed.
    /// - [`MapError::HugePageConflict`] if a huge leaf covers `virt`.
    pub fn map<A: FrameAlloc + ?Sized>(
        &mut self,
        alloc: &mut A,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        permissions: PagePermissions,
        mode: MapMode,
    ) -> Result<Option<PhysicalFrame>, MapError> {
        let page = VirtualPage::from_start_address(virt)?;
        let frame = PhysicalFrame::from_start_address(phys)?;

        // Phase 1: read-only walk to find out what is missing.
        let missing_from = match self.walk(virt) {
            Walk::Complete([.., leaf]) => {
                if let PageTableEntry::Page { frame: existing, .. } =
                    self.table(leaf.0).entry(leaf.1, TableLevel::Pt)
                    && mode == MapMode::Insert
                {
                    return Err(MapError::AlreadyMapped {
                        page,
                        frame: existing,
                    });
                }
                None
            }
            Walk::Missing { level } => Some(level),
            Walk::Huge { level } => return Err(MapError::HugePageConflict { page, level }),
        };

        // Phase 2: reserve every table the walk will need, or none.
        let mut reserved = ArrayVec::<PhysicalFrame, 3>::new();
        let mut level = missing_from;
        while let Some(l) = level.filter(|l| *l != TableLevel::Pt) {
            let Some(table) = alloc.alloc_4k() else {
                for f in reserved.drain(..) {
                    alloc.free_4k(f);
                }
                warn!("mapping {page} failed: no frame for a {l} table");
                return Err(MapError::TableAllocation { level: l.lower().unwrap_or(l) });
            };
            unsafe { self.mapper.zero_frame(table) };
            reserved.push(table);
            level = l.lower();
        }

        // Phase 3: link reserved tables and write the leaf. Cannot fail.
        let mut reserved = reserved.into_iter();
        let mut parent: Option<((PhysicalFrame, usize), TableLevel)> = None;
        let mut current = self.root;
        for level in TableLevel::INTERMEDIATE {
            let index = level.index_of(virt);
            let next = match self.table(current).entry(index, level) {
                PageTableEntry::Table { frame, .. } => frame,
                _ => {
                    let Some(fresh) = reserved.next() else {
                        return Err(MapError::TableAllocation { level });
                    };
                    self.table(current).set(
                        index,
                        PageTableEntry::Table {
                            frame: fresh,
                            live_entries: 0,
                        },
                    );
                    if let Some((slot, l)) = parent {
                        self.adjust_live(slot, l, 1);
                    }
                    trace!("new {} table {fresh} for {page}", level.lower().unwrap_or(level));
                    fresh
                }
            };
            parent = Some(((current, index), level));
            current = next;
        }

        let index = TableLevel::Pt.index_of(virt);
        let pt = self.table(current);
        let previous = match pt.entry(index, TableLevel::Pt) {
            PageTableEntry::Page { frame, .. } => Some(frame),
            _ => None,
        };
        pt.set(index, PageTableEntry::Page { frame, permissions });
        match (previous, parent) {
            (None, Some((slot, l))) => {
                self.adjust_live(slot, l, 1);
            }
            (Some(_), _) => self.flush(virt),
            (None, None) => {}
        }
        Ok(previous)
    }

    /// Remove the 4 KiB mapping at `virt` and return the frame it referenced.
    ///
    /// Intermediate tables left without any present entry are freed and
    /// unlinked, up to (not including) the root.
    ///
    /// # Errors
    /// - [`UnmapError::Address`] for a misaligned or non-canonical `virt`.
    /// - [`UnmapError::NotMapped`] if no 4 KiB leaf exists.
    /// - [`UnmapError::HugePageConflict`] if a huge leaf covers `virt`.
    pub fn unmap<A: FrameAlloc + ?Sized>(
        &mut self,
        alloc: &mut A,
        virt: VirtualAddress,
        mode: UnmapMode,
    ) -> Result<PhysicalFrame, UnmapError> {
        let page = VirtualPage::from_start_address(virt)?;
        let path = match self.walk(virt) {
            Walk::Complete(path) => path,
            Walk::Missing { .. } => return Err(UnmapError::NotMapped(page)),
            Walk::Huge { level } => return Err(UnmapError::HugePageConflict { page, level }),
        };

        let (pt, index) = path[3];
        let PageTableEntry::Page { frame, .. } = self.table(pt).entry(index, TableLevel::Pt) else {
            return Err(UnmapError::NotMapped(page));
        };
        self.table(pt).set(index, PageTableEntry::Absent);
        self.flush(virt);

        // Walk back up: PD entry → PDPT entry → PML4 entry.
        for depth in (0..3).rev() {
            let level = TableLevel::INTERMEDIATE[depth];
            if self.adjust_live(path[depth], level, -1) != Some(0) {
                break;
            }
            let (holder, slot) = path[depth];
            let empty = path[depth + 1].0;
            self.table(holder).set(slot, PageTableEntry::Absent);
            alloc.free_4k(empty);
            trace!("freed empty {} table {empty}", level.lower().unwrap_or(level));
        }

        if mode == UnmapMode::ReleaseFrame {
            alloc.free_4k(frame);
        }
        Ok(frame)
    }

    /// Translate `virt` to a physical address, keeping the in-page offset.
    ///
    /// `None` if unmapped or non-canonical.
    #[must_use]
    pub fn translate(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        if !virt.is_canonical() {
            return None;
        }
        let mut frame = self.root;
        let mut level = TableLevel::Pml4;
        loop {
            match self.table(frame).entry(level.index_of(virt), level) {
                PageTableEntry::Absent => return None,
                PageTableEntry::Table { frame: next, .. } => {
                    frame = next;
                    level = level.lower()?;
                }
                PageTableEntry::Page { frame, .. } => {
                    return Some(frame.start_address() + virt.page_offset());
                }
                PageTableEntry::HugePage { base, .. } => {
                    return Some(base + (virt.as_u64() & (level.entry_span() - 1)));
                }
            }
        }
    }

    /// The 4 KiB leaf mapping `virt`, if any.
    #[must_use]
    pub fn lookup(&self, virt: VirtualAddress) -> Option<(PhysicalFrame, PagePermissions)> {
        if !virt.is_canonical() {
            return None;
        }
        let Walk::Complete([.., (pt, index)]) = self.walk(virt) else {
            return None;
        };
        match self.table(pt).entry(index, TableLevel::Pt) {
            PageTableEntry::Page { frame, permissions } => Some((frame, permissions)),
            _ => None,
        }
    }

    /// Decoded entry at `level` on the walk for `virt`, if the walk gets there.
    #[must_use]
    pub fn entry(&self, virt: VirtualAddress, level: TableLevel) -> Option<PageTableEntry> {
        let mut frame = self.root;
        let mut current = TableLevel::Pml4;
        loop {
            let entry = self.table(frame).entry(current.index_of(virt), current);
            if current == level {
                return Some(entry);
            }
            let PageTableEntry::Table { frame: next, .. } = entry else {
                return None;
            };
            frame = next;
            current = current.lower()?;
        }
    }

    /// Number of tables in the tree, root included.
    #[must_use]
    pub fn table_count(&self) -> usize {
        self.count_tables(self.root, TableLevel::Pml4)
    }

    fn count_tables(&self, frame: PhysicalFrame, level: TableLevel) -> usize {
        let table = self.table(frame);
        let mut count = 1;
        if level == TableLevel::Pt {
            return count;
        }
        for index in 0..crate::ENTRIES_PER_TABLE {
            if let PageTableEntry::Table { frame: child, .. } = table.entry(index, level)
                && let Some(lower) = level.lower()
            {
                count += self.count_tables(child, lower);
            }
        }
        count
    }

    /// Free every table of this space, root included. Leaf frames are left alone.
    pub fn release_tables<A: FrameAlloc + ?Sized>(self, alloc: &mut A) {
        self.release_subtree(alloc, self.root, TableLevel::Pml4);
    }

    fn release_subtree<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &mut A,
        frame: PhysicalFrame,
        level: TableLevel,
    ) {
        if let Some(lower) = level.lower() {
            for index in 0..crate::ENTRIES_PER_TABLE {
                if let PageTableEntry::Table { frame: child, .. } =
                    self.table(frame).entry(index, level)
                {
                    self.release_subtree(alloc, child, lower);
                }
            }
        }
        alloc.free_4k(frame);
    }

    #[inline]
    fn flush(&self, virt: VirtualAddress) {
        if self.active {
            unsafe { kernel_registers::tlb::flush(virt) };
        }
    }
}
