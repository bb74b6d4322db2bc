//! # Global allocator adapter
//!
//! [`KernelMemory`] holds the one [`MemoryManager`] of the running kernel and
//! forwards [`GlobalAlloc`] to its heap, so `alloc` collections work once
//! memory is initialized.
//!
//! ```ignore
//! #[global_allocator]
//! static MEMORY: KernelMemory<OffsetPhysMapper> = KernelMemory::new();
//! ```
//!
//! Every [`Layout`] alignment is honoured through
//! [`MemoryManager::kalloc_aligned`]. Requests made before
//! [`KernelMemory::init`] fail with a null pointer.

use crate::error::MemoryError;
use crate::manager::MemoryManager;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{NonNull, null_mut};
use kernel_sync::SyncOnceCell;
use kernel_vmem::PhysMapper;
use log::error;

pub struct KernelMemory<M: PhysMapper + 'static> {
    manager: SyncOnceCell<MemoryManager<'static, M>>,
}

impl<M: PhysMapper + 'static> Default for KernelMemory<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: PhysMapper + 'static> KernelMemory<M> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            manager: SyncOnceCell::new(),
        }
    }

    /// Install the memory manager.
    ///
    /// # Errors
    /// [`MemoryError::AlreadyInitialized`] if one is installed already; the
    /// new manager is dropped.
    pub fn init(&self, manager: MemoryManager<'static, M>) -> Result<&MemoryManager<'static, M>, MemoryError> {
        self.manager
            .set(manager)
            .map_err(|_| MemoryError::AlreadyInitialized)
    }

    #[inline]
    #[must_use]
    pub fn get(&self) -> Option<&MemoryManager<'static, M>> {
        self.manager.get()
    }
}

unsafe impl<M: PhysMapper + Sync + 'static> GlobalAlloc for KernelMemory<M> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.get()
            .and_then(|m| m.kalloc_aligned(layout.size(), layout.align()))
            .map_or(null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let Some(pointer) = NonNull::new(ptr) else {
            return;
        };
        match self.get() {
            Some(m) => {
                if let Err(e) = m.kfree(pointer) {
                    error!("dealloc({ptr:p}): {e}");
                }
            }
            None => error!("dealloc({ptr:p}) before memory init"),
        }
    }
}
