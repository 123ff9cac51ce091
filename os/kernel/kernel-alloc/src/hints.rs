use bitfield_struct::bitfield;

/// Orthogonal flags attached to an allocation request.
///
/// The allocators act on [`kernel`](Self::kernel) (placement toward the top
/// of memory) and [`atomic`](Self::atomic) (take locks with interrupts
/// withheld). The remaining flags are carried for future policies.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct AllocHints {
    /// Called from a context that must not be interrupted while holding a lock.
    pub atomic: bool,
    /// Memory owned by the kernel itself.
    pub kernel: bool,
    pub swapped: bool,
    pub shared: bool,
    pub high_mem: bool,
    /// Must be reachable by legacy DMA engines.
    pub dma: bool,
    pub cached: bool,
    #[bits(1)]
    __reserved: u8,
}

impl AllocHints {
    /// A plain kernel-owned request.
    pub const KERNEL: Self = Self::new().with_kernel(true);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_are_independent_bits() {
        let hints = AllocHints::KERNEL.with_atomic(true).with_dma(true);
        assert_eq!(hints.into_bits(), 0b0010_0011);
        assert!(!hints.shared());
        assert_eq!(AllocHints::new().into_bits(), 0);
    }
}
