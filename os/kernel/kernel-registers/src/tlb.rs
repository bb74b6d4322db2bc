//! TLB maintenance for the current CPU.

use kernel_memory_addresses::VirtualAddress;

/// Drop the translation for the page containing `va` on this CPU.
///
/// # Safety
/// Must run at CPL0.
#[inline]
pub unsafe fn flush(va: VirtualAddress) {
    #[cfg(all(feature = "asm", target_arch = "x86_64"))]
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
    }
    #[cfg(not(all(feature = "asm", target_arch = "x86_64")))]
    let _ = va;
}

/// Drop all non-global translations on this CPU by rewriting CR3.
///
/// # Safety
/// Must run at CPL0 with paging enabled.
#[inline]
pub unsafe fn flush_all() {
    #[cfg(all(feature = "asm", feature = "cr3", target_arch = "x86_64"))]
    unsafe {
        use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe, cr3::Cr3};
        Cr3::load_unsafe().store_unsafe();
    }
}
