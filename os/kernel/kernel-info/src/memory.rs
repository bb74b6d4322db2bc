//! # Memory Layout

/// End of userspace VA range after which Kernel space begins.
pub const LAST_USERSPACE_ADDRESS: u64 = 0xffff_0000_0000_0000;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything you map at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Largest physical address span the direct map may cover.
pub const HHDM_MAX_SPAN: u64 = 0x0000_1000_0000_0000; // 16 TiB

/// Start of the kernel heap window.
pub const KERNEL_HEAP_BASE: u64 = 0xffff_c000_0000_0000;

/// Bytes mapped for the heap during initialization.
pub const KERNEL_HEAP_INITIAL_SIZE: u64 = 64 * 1024;

/// Hard cap on the heap window; growth beyond this is out-of-memory.
pub const KERNEL_HEAP_MAX_SIZE: u64 = 128 * 1024 * 1024;

/// Number of block descriptors the heap can track at once.
pub const KERNEL_HEAP_BLOCK_SLOTS: usize = 256;

/// Page the memory self-test maps and unmaps again; never used otherwise.
pub const SELF_TEST_PAGE: u64 = KERNEL_HEAP_BASE - 0x1000;

/// Where the kernel executes (VMA), matches your linker script.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Where you place the bytes in *physical* memory (LMA) before paging.
pub const PHYS_LOAD: u64 = 0x0010_0000; // 1 MiB

const _: () = {
    assert!(HHDM_BASE >= LAST_USERSPACE_ADDRESS);
    assert!(HHDM_BASE + HHDM_MAX_SPAN <= KERNEL_HEAP_BASE);
    assert!(KERNEL_HEAP_BASE + KERNEL_HEAP_MAX_SIZE <= KERNEL_BASE);
    assert!(KERNEL_HEAP_INITIAL_SIZE.is_multiple_of(4096));
    assert!(KERNEL_HEAP_MAX_SIZE.is_multiple_of(4096));
    assert!(KERNEL_HEAP_INITIAL_SIZE <= KERNEL_HEAP_MAX_SIZE);
    assert!(KERNEL_HEAP_BLOCK_SLOTS >= 2 && KERNEL_HEAP_BLOCK_SLOTS <= u16::MAX as usize);
    assert!(PHYS_LOAD.is_multiple_of(4096));
    assert!(SELF_TEST_PAGE >= HHDM_BASE + HHDM_MAX_SPAN);
};
