//! # Kernel Configuration and Boot Interface
//!
//! Memory layout constants and the bootloader-to-kernel memory handoff types
//! consumed by the memory-management crates.
//!
//! ## Architecture
//!
//! ### Memory Layout ([`memory`])
//! Compile-time virtual address space layout:
//! * **HHDM**: offset window through which all physical memory is reachable
//! * **Kernel heap**: dedicated virtual window grown on demand
//! * **Kernel image**: higher-half link address and physical load address
//!
//! ### Boot Information ([`boot`])
//! What the bootloader tells the kernel about physical memory:
//! * **Memory map**: [`MemoryRegion`](boot::MemoryRegion) records tagged with
//!   a [`MemoryRegionKind`](boot::MemoryRegionKind)
//! * **Kernel image**: physical and virtual bounds of the loaded kernel
//!
//! ## Virtual Memory Architecture
//!
//! ```text
//! Virtual Address Space Layout (64-bit):
//!
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │         User Space              │
//! LAST_USERSPACE_ADDRESS├─────────────────────────────────┤ 0xffff_0000_0000_0000
//!                       │        Guard Region             │
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │   Higher Half Direct Mapping    │
//! KERNEL_HEAP_BASE      ├─────────────────────────────────┤ 0xffff_c000_0000_0000
//!                       │   Kernel Heap (grows upward)    │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │       Kernel Text & Data        │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! All layout constants carry `const` assertions so an inconsistent layout
//! fails the build instead of the boot.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
