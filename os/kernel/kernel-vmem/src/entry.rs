use crate::table::TableLevel;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalFrame};

bitflags::bitflags! {
    /// Attributes of a leaf mapping.
    ///
    /// The empty set means: present, kernel-only, read-only, executable,
    /// write-back cached, flushed on CR3 reload.
    #[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct PagePermissions: u8 {
        /// Writes are allowed (RW).
        const WRITABLE = 1 << 0;
        /// Ring 3 may access the page (US).
        const USER_ACCESSIBLE = 1 << 1;
        /// Write-through instead of write-back caching (PWT).
        const WRITE_THROUGH = 1 << 2;
        /// Bypass the caches, e.g. for MMIO (PCD).
        const CACHE_DISABLE = 1 << 3;
        /// Instruction fetches fault (NX, needs `EFER.NXE`).
        const NO_EXECUTE = 1 << 4;
        /// Survives CR3 reloads in the TLB (G, needs `CR4.PGE`).
        const GLOBAL = 1 << 5;
    }
}

/// A single 64-bit x86-64 page table entry in its hardware layout.
///
/// | Bits   | Field | Use here |
/// |--------|-------|----------|
/// | 0      | P     | present |
/// | 1      | RW    | writable |
/// | 2      | US    | user accessible |
/// | 3      | PWT   | write-through |
/// | 4      | PCD   | cache disable |
/// | 5      | A     | set by the CPU |
/// | 6      | D     | set by the CPU (leaf) |
/// | 7      | PS    | huge leaf at PD/PDPT |
/// | 8      | G     | global (leaf) |
/// | 9–11   | AVL   | live-entry count, low 3 bits (non-leaf) |
/// | 12–51  | addr  | frame number |
/// | 52–58  | AVL   | live-entry count, high 7 bits (non-leaf) |
/// | 59–62  | PKU   | unused |
/// | 63     | NX    | no-execute |
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct RawEntry {
    pub present: bool,
    pub writable: bool,
    pub user_access: bool,
    pub write_through: bool,
    pub cache_disabled: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub huge_page: bool,
    pub global: bool,
    #[bits(3)]
    live_low: u16,
    #[bits(40)]
    frame_number: u64,
    #[bits(7)]
    live_high: u16,
    #[bits(4)]
    __: u8,
    pub no_execute: bool,
}

impl RawEntry {
    /// Bits of the live count stored in `live_low`.
    const LIVE_SPLIT: u32 = 3;

    #[inline]
    #[must_use]
    pub const fn frame(&self) -> PhysicalFrame {
        PhysicalFrame::from_number(self.frame_number())
    }

    #[inline]
    #[must_use]
    const fn with_frame(self, frame: PhysicalFrame) -> Self {
        self.with_frame_number(frame.number())
    }

    /// Live-entry count kept in the OS-available bits.
    #[inline]
    #[must_use]
    pub const fn live_entries(&self) -> u16 {
        self.live_low() | (self.live_high() << Self::LIVE_SPLIT)
    }

    #[inline]
    #[must_use]
    const fn with_live_entries(self, count: u16) -> Self {
        self.with_live_low(count & ((1 << Self::LIVE_SPLIT) - 1))
            .with_live_high(count >> Self::LIVE_SPLIT)
    }

    #[inline]
    #[must_use]
    const fn with_permissions(self, p: PagePermissions) -> Self {
        self.with_writable(p.contains(PagePermissions::WRITABLE))
            .with_user_access(p.contains(PagePermissions::USER_ACCESSIBLE))
            .with_write_through(p.contains(PagePermissions::WRITE_THROUGH))
            .with_cache_disabled(p.contains(PagePermissions::CACHE_DISABLE))
            .with_no_execute(p.contains(PagePermissions::NO_EXECUTE))
            .with_global(p.contains(PagePermissions::GLOBAL))
    }

    #[must_use]
    pub fn permissions(&self) -> PagePermissions {
        let mut p = PagePermissions::empty();
        p.set(PagePermissions::WRITABLE, self.writable());
        p.set(PagePermissions::USER_ACCESSIBLE, self.user_access());
        p.set(PagePermissions::WRITE_THROUGH, self.write_through());
        p.set(PagePermissions::CACHE_DISABLE, self.cache_disabled());
        p.set(PagePermissions::NO_EXECUTE, self.no_execute());
        p.set(PagePermissions::GLOBAL, self.global());
        p
    }
}

/// Semantic view of one page-table slot.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PageTableEntry {
    /// Not present.
    Absent,
    /// Points at a lower-level table holding `live_entries` present entries.
    Table {
        frame: PhysicalFrame,
        live_entries: u16,
    },
    /// 4 KiB leaf (PT level).
    Page {
        frame: PhysicalFrame,
        permissions: PagePermissions,
    },
    /// 2 MiB (PD) or 1 GiB (PDPT) leaf.
    HugePage {
        base: PhysicalAddress,
        permissions: PagePermissions,
    },
}

impl PageTableEntry {
    /// Interpret `raw` as found in a table of `level`.
    #[must_use]
    pub fn decode(raw: RawEntry, level: TableLevel) -> Self {
        if !raw.present() {
            return Self::Absent;
        }
        match level {
            TableLevel::Pt => Self::Page {
                frame: raw.frame(),
                permissions: raw.permissions(),
            },
            TableLevel::Pd | TableLevel::Pdpt if raw.huge_page() => Self::HugePage {
                base: raw.frame().start_address(),
                permissions: raw.permissions(),
            },
            _ => Self::Table {
                frame: raw.frame(),
                live_entries: raw.live_entries(),
            },
        }
    }

    /// Hardware encoding. Intermediate entries are writable and user
    /// accessible so that the leaf alone decides the effective permissions.
    #[must_use]
    pub const fn encode(self) -> RawEntry {
        match self {
            Self::Absent => RawEntry::new(),
            Self::Table {
                frame,
                live_entries,
            } => RawEntry::new()
                .with_present(true)
                .with_writable(true)
                .with_user_access(true)
                .with_frame(frame)
                .with_live_entries(live_entries),
            Self::Page { frame, permissions } => RawEntry::new()
                .with_present(true)
                .with_frame(frame)
                .with_permissions(permissions),
            Self::HugePage { base, permissions } => RawEntry::new()
                .with_present(true)
                .with_huge_page(true)
                .with_frame(PhysicalFrame::containing_address(base))
                .with_permissions(permissions),
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_present(&self) -> bool {
        !matches!(self, Self::Absent)
    }
}
