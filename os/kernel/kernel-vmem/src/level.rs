use kernel_memory_addresses::VirtualAddress;

/// The four levels of the x86-64 paging hierarchy.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum PageLevel {
    /// Page table; entries map 4 KiB.
    Pt = 1,
    /// Page directory; entries span 2 MiB.
    Pd = 2,
    /// Page-directory-pointer table; entries span 1 GiB.
    Pdpt = 3,
    /// Root table; entries span 512 GiB.
    Pml4 = 4,
}

impl PageLevel {
    /// Position of this level's index field inside a virtual address.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        12 + 9 * (self as u32 - 1)
    }

    /// Bytes covered by one entry at this level.
    #[inline]
    #[must_use]
    pub const fn span(self) -> u64 {
        1 << self.shift()
    }

    /// The 9-bit table index `va` selects at this level.
    #[inline]
    #[must_use]
    pub const fn index_of(self, va: VirtualAddress) -> usize {
        ((va.as_u64() >> self.shift()) & 0x1FF) as usize
    }

    /// The next level toward the leaves.
    #[inline]
    #[must_use]
    pub const fn lower(self) -> Option<Self> {
        match self {
            Self::Pml4 => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pd => Some(Self::Pt),
            Self::Pt => None,
        }
    }

    /// Whether an entry at this level may map memory directly.
    #[inline]
    #[must_use]
    pub const fn supports_leaf(self) -> bool {
        !matches!(self, Self::Pml4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_and_indices() {
        assert_eq!(PageLevel::Pt.span(), 4096);
        assert_eq!(PageLevel::Pd.span(), 2 * 1024 * 1024);
        assert_eq!(PageLevel::Pdpt.span(), 1024 * 1024 * 1024);
        assert_eq!(PageLevel::Pml4.span(), 512 * 1024 * 1024 * 1024);

        let va = VirtualAddress::new(0xFFFF_FFFF_8020_3000);
        assert_eq!(PageLevel::Pml4.index_of(va), 511);
        assert_eq!(PageLevel::Pdpt.index_of(va), 510);
        assert_eq!(PageLevel::Pd.index_of(va), 1);
        assert_eq!(PageLevel::Pt.index_of(va), 3);
    }
}
