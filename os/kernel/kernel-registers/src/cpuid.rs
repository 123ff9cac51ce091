use bitfield_struct::bitfield;

/// Highest extended leaf is reported in `cpuid(0x8000_0000).eax`.
pub const LEAF_EXTENDED_MAX: u32 = 0x8000_0000;

/// Extended processor signature and feature bits.
pub const LEAF_8000_0001H: u32 = 0x8000_0001;

/// Execute CPUID with the given leaf and subleaf.
///
/// # Safety
/// The `cpuid` instruction must be available (always true on x86-64).
#[inline(always)]
#[allow(unused_assignments, clippy::inline_always)]
#[must_use]
pub unsafe fn cpuid(leaf: u32, subleaf: u32) -> CpuidResult {
    let (mut eax, mut ebx, mut ecx, mut edx) = (leaf, 0u32, subleaf, 0u32);
    unsafe {
        core::arch::asm!(
            "push rbx",
            "cpuid",
            "mov {ebx_out:e}, ebx",
            "pop rbx",
            ebx_out = lateout(reg) ebx,
            inlateout("eax") eax,
            inlateout("ecx") ecx,
            lateout("edx") edx,
            options(nomem, preserves_flags),
        );
    }
    CpuidResult { eax, ebx, ecx, edx }
}

#[derive(Debug, Copy, Clone)]
#[repr(C)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// CPUID.80000001H:EDX, the paging-related extended feature flags.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct Leaf80000001Edx {
    #[bits(11)]
    __reserved_low: u16,

    /// SYSCALL/SYSRET in 64-bit mode.
    pub syscall: bool,

    #[bits(8)]
    __reserved_mid: u8,

    /// Execute-disable bit (page-table bit 63) is available.
    pub nx: bool,

    #[bits(5)]
    __reserved_high: u8,

    /// 1 GiB pages at the PDPT level.
    pub page1gb: bool,

    /// RDTSCP and IA32_TSC_AUX.
    pub rdtscp: bool,

    #[bits(1)]
    __reserved_top: u8,

    /// Intel 64 / long mode.
    pub long_mode: bool,

    #[bits(2)]
    __reserved_end: u8,
}

impl Leaf80000001Edx {
    /// Read the leaf, or `None` if the processor does not report it.
    #[must_use]
    pub fn read() -> Option<Self> {
        // SAFETY: CPUID exists on every x86-64 processor and is not privileged.
        let max = unsafe { cpuid(LEAF_EXTENDED_MAX, 0) }.eax;
        if max < LEAF_8000_0001H {
            return None;
        }
        let r = unsafe { cpuid(LEAF_8000_0001H, 0) };
        Some(Self::from_bits(r.edx))
    }
}
