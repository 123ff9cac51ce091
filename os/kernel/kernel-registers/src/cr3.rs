use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// CR3: root of the active 4-level page-table hierarchy (PCID disabled).
///
/// Writing CR3 switches address spaces and flushes every non-global TLB
/// entry.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct Cr3 {
    #[bits(3)]
    __reserved_low: u8,

    /// Page-level write-through for the PML4 walk.
    pub pwt: bool,

    /// Page-level cache disable for the PML4 walk.
    pub pcd: bool,

    #[bits(7)]
    __reserved_mid: u8,

    /// PML4 frame number (physical base >> 12).
    #[bits(40)]
    root_frame: u64,

    #[bits(12)]
    __reserved_high: u16,
}

impl Cr3 {
    /// A CR3 value pointing at the PML4 in `root`, with write-back caching.
    #[must_use]
    pub const fn with_root(root: PhysicalPage<Size4K>) -> Self {
        Self::new().with_root_frame(root.number())
    }

    /// The frame holding the PML4.
    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        PhysicalPage::containing(PhysicalAddress::new(self.root_frame() << 12))
    }
}

#[cfg(feature = "asm")]
impl LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(feature = "asm")]
impl StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}
