//! # Kernel Memory Management
//!
//! Physical frame allocation, the kernel address space and the kernel heap,
//! tied together by [`MemoryManager`].
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  MemoryManager                      │
//! │    • kalloc / kfree                                 │
//! │    • map_page / unmap_page / translate              │
//! │    • one spin lock per component                    │
//! └──────┬──────────────────┬───────────────────┬───────┘
//!        │                  │                   │
//! ┌──────▼───────┐   ┌──────▼────────┐   ┌──────▼───────┐
//! │ HeapAllocator│   │ AddressSpace  │   │ BitmapFrame- │
//! │ first fit,   │──►│ (kernel-vmem) │──►│ Allocator    │
//! │ split, merge │   │ 4-level tables│   │ lowest first │
//! └──────────────┘   └───────────────┘   └──────────────┘
//! ```
//!
//! The heap grows by asking the address space for fresh pages
//! ([`heap::HeapBacking`], implemented by [`vmm::Vmm`]); the address space
//! takes page-table frames from the frame allocator
//! ([`kernel_vmem::FrameAlloc`]).
//!
//! ## Core Components
//!
//! ### Frames ([`frame_alloc`], [`bitmap`], [`bootstrap`])
//!
//! One bit per 4 KiB frame, set when the frame is in use. Allocation scans
//! upward from the lowest frame, so the lowest free frame is always returned.
//! Freeing a free frame is reported as a double free and changes nothing.
//! Before the bitmap exists, [`bootstrap::BootstrapFrameAllocator`] places
//! its storage.
//!
//! ### Address Space ([`vmm`], [`phys_mapper`])
//!
//! [`kernel_vmem::AddressSpace`] owns the page tables; [`vmm::Vmm`] pairs it
//! with a frame allocator for multi-page work with rollback.
//! [`phys_mapper::OffsetPhysMapper`] reaches physical memory through the
//! direct map.
//!
//! ### Heap ([`heap`])
//!
//! A first-fit allocator over a fixed virtual window. Block bookkeeping lives
//! in an index-based arena, never in the heap pages themselves.
//!
//! ## Usage
//!
//! ```ignore
//! let manager = MemoryManager::init(&memory_map, kernel_image, &HHDM, MemoryConfig::new())?;
//! let manager = MEMORY.init(manager)?;
//! unsafe { manager.activate() };
//!
//! let buffer = manager.kalloc(512).ok_or(MemoryError::OutOfMemory)?;
//! manager.kfree(buffer)?;
//! ```
//!
//! ## Safety
//!
//! Physical memory is only ever touched through a [`kernel_vmem::PhysMapper`].
//! Callers of [`MemoryManager::init`] promise that the mapper reaches every
//! usable frame of the memory map.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod bitmap;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod frame_alloc;
pub mod global;
pub mod heap;
pub mod manager;
pub mod phys_mapper;
pub mod vmm;

pub use crate::config::MemoryConfig;
pub use crate::error::MemoryError;
pub use crate::frame_alloc::{BitmapFrameAllocator, FrameError, FrameState};
pub use crate::global::KernelMemory;
pub use crate::heap::{HeapAllocator, HeapError};
pub use crate::manager::{MemoryManager, MemoryStats};
pub use crate::phys_mapper::OffsetPhysMapper;
pub use kernel_vmem::PagePermissions;
