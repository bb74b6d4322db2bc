//! Runtime memory configuration.
//!
//! Defaults come from the compile-time layout in [`kernel_info::memory`];
//! tests and alternative boot paths override single values with the
//! `with_*` builders.

use crate::error::MemoryError;
use kernel_info::memory::{
    HHDM_BASE, HHDM_MAX_SPAN, KERNEL_HEAP_BASE, KERNEL_HEAP_INITIAL_SIZE, KERNEL_HEAP_MAX_SIZE,
};
use kernel_memory_addresses::{FRAME_SIZE, VirtualAddress, is_aligned};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryConfig {
    /// Virtual address at which physical address 0 appears in the direct map.
    pub direct_map_offset: u64,
    /// First byte of the heap window.
    pub heap_start: u64,
    /// Bytes mapped for the heap during initialization.
    pub heap_initial_size: u64,
    /// Size of the heap window; the heap never grows past it.
    pub heap_max_size: u64,
    /// Whether the kernel image is mapped at its link address in the new space.
    pub map_kernel_image: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            direct_map_offset: HHDM_BASE,
            heap_start: KERNEL_HEAP_BASE,
            heap_initial_size: KERNEL_HEAP_INITIAL_SIZE,
            heap_max_size: KERNEL_HEAP_MAX_SIZE,
            map_kernel_image: true,
        }
    }

    #[must_use]
    pub const fn with_direct_map_offset(mut self, offset: u64) -> Self {
        self.direct_map_offset = offset;
        self
    }

    #[must_use]
    pub const fn with_heap_start(mut self, start: u64) -> Self {
        self.heap_start = start;
        self
    }

    #[must_use]
    pub const fn with_heap_initial_size(mut self, bytes: u64) -> Self {
        self.heap_initial_size = bytes;
        self
    }

    #[must_use]
    pub const fn with_heap_max_size(mut self, bytes: u64) -> Self {
        self.heap_max_size = bytes;
        self
    }

    #[must_use]
    pub const fn with_kernel_image_mapping(mut self, map: bool) -> Self {
        self.map_kernel_image = map;
        self
    }

    /// Whether `va` lies in the heap window.
    #[must_use]
    pub const fn in_heap_window(&self, va: VirtualAddress) -> bool {
        let va = va.as_u64();
        va >= self.heap_start && va - self.heap_start < self.heap_max_size
    }

    /// Whether `va` lies in the direct-map window.
    #[must_use]
    pub const fn in_direct_map(&self, va: VirtualAddress) -> bool {
        let va = va.as_u64();
        va >= self.direct_map_offset && va - self.direct_map_offset < HHDM_MAX_SPAN
    }

    /// # Errors
    /// [`MemoryError::InvalidConfig`] naming the first rule that is broken.
    pub fn validate(&self) -> Result<(), MemoryError> {
        let check = |ok: bool, what: &'static str| {
            if ok { Ok(()) } else { Err(MemoryError::InvalidConfig(what)) }
        };
        check(
            is_aligned(self.direct_map_offset, FRAME_SIZE)
                && VirtualAddress::new(self.direct_map_offset).is_canonical(),
            "direct map offset must be page aligned and canonical",
        )?;
        check(
            is_aligned(self.heap_start, FRAME_SIZE) && is_aligned(self.heap_max_size, FRAME_SIZE),
            "heap window must be page aligned",
        )?;
        check(self.heap_max_size > 0, "heap window must not be empty")?;
        check(
            self.heap_initial_size <= self.heap_max_size,
            "initial heap size exceeds the heap window",
        )?;
        let heap_last = self.heap_start.checked_add(self.heap_max_size - 1);
        check(
            VirtualAddress::new(self.heap_start).is_canonical()
                && heap_last.is_some_and(|last| {
                    VirtualAddress::new(last).is_canonical()
                        && (last ^ self.heap_start) >> 47 == 0
                }),
            "heap window must be canonical and stay in one half",
        )?;
        let direct_end = self.direct_map_offset.saturating_add(HHDM_MAX_SPAN);
        check(
            heap_last.is_some_and(|last| last < self.direct_map_offset || self.heap_start >= direct_end),
            "heap window overlaps the direct map",
        )
    }
}
