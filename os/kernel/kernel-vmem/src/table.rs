use crate::entry::{PageTableEntry, RawEntry};
use core::fmt;
use kernel_memory_addresses::VirtualAddress;

/// Entries per table at every level.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Paging level of a table, numbered like the hardware walk (PT = 1).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TableLevel {
    Pt = 1,
    Pd = 2,
    Pdpt = 3,
    Pml4 = 4,
}

impl TableLevel {
    /// Non-leaf levels in walk order.
    pub const INTERMEDIATE: [Self; 3] = [Self::Pml4, Self::Pdpt, Self::Pd];

    /// Bit position of this level's index field in a virtual address.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        12 + 9 * (self as u32 - 1)
    }

    /// Index into a table of this level for `va`.
    ///
    /// ```rust
    /// # use kernel_vmem::{TableLevel, VirtualAddress};
    /// let va = VirtualAddress::new(0xFFFF_8000_4020_3000);
    /// assert_eq!(TableLevel::Pml4.index_of(va), 256);
    /// assert_eq!(TableLevel::Pdpt.index_of(va), 1);
    /// assert_eq!(TableLevel::Pd.index_of(va), 1);
    /// assert_eq!(TableLevel::Pt.index_of(va), 3);
    /// ```
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn index_of(self, va: VirtualAddress) -> usize {
        ((va.as_u64() >> self.shift()) & 0x1FF) as usize
    }

    /// Bytes mapped by one leaf entry at this level.
    #[inline]
    #[must_use]
    pub const fn entry_span(self) -> u64 {
        1 << self.shift()
    }

    #[inline]
    #[must_use]
    pub const fn lower(self) -> Option<Self> {
        match self {
            Self::Pml4 => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pd => Some(Self::Pt),
            Self::Pt => None,
        }
    }
}

impl fmt::Display for TableLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pt => "PT",
            Self::Pd => "PD",
            Self::Pdpt => "PDPT",
            Self::Pml4 => "PML4",
        })
    }
}

/// One 4 KiB page table (any level).
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [RawEntry; ENTRIES_PER_TABLE],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    #[inline]
    #[must_use]
    pub const fn raw(&self, index: usize) -> RawEntry {
        self.entries[index]
    }

    /// Decoded entry at `index`, for a table at `level`.
    #[inline]
    #[must_use]
    pub fn entry(&self, index: usize, level: TableLevel) -> PageTableEntry {
        PageTableEntry::decode(self.entries[index], level)
    }

    #[inline]
    pub const fn set(&mut self, index: usize, entry: PageTableEntry) {
        self.entries[index] = entry.encode();
    }

    #[inline]
    pub fn clear(&mut self) {
        self.entries.fill(RawEntry::new());
    }

    /// Number of entries with the present bit set.
    #[must_use]
    pub fn present_count(&self) -> usize {
        self.entries.iter().filter(|e| e.present()).count()
    }
}
