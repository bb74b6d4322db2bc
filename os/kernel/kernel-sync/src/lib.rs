//! # Kernel synchronization primitives
//!
//! - [`SpinLock`]: test-and-test-and-set lock with an RAII guard. Every
//!   allocator in the memory subsystem sits behind one of these and holds it
//!   only for the duration of a single call.
//! - [`SyncOnceCell`]: write-once cell for kernel-wide singletons.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;
mod sync_once_cell;

pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
