//! TLB maintenance after changing mappings of the active address space.
//!
//! Only emitted on bare-metal x86-64; hosted builds have no TLB of ours to
//! maintain.

use kernel_memory_addresses::VirtualAddress;

/// Drop the translation for the page containing `va` (`invlpg`).
#[inline]
pub fn invalidate_page(va: VirtualAddress) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let _ = va;
}
