use crate::{PageSize, PhysicalAddress, Size4K, VirtualAddress};
use core::fmt;

macro_rules! address_range {
    ($(#[$doc:meta])* $name:ident, $addr:ident) => {
        $(#[$doc])*
        #[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
        pub struct $name {
            base: $addr,
            len: u64,
        }

        impl $name {
            #[inline]
            #[must_use]
            pub const fn new(base: $addr, len: u64) -> Self {
                Self { base, len }
            }

            #[inline]
            #[must_use]
            pub const fn base(self) -> $addr {
                self.base
            }

            #[inline]
            #[must_use]
            pub const fn len(self) -> u64 {
                self.len
            }

            #[inline]
            #[must_use]
            pub const fn is_empty(self) -> bool {
                self.len == 0
            }

            /// Last byte inside the range, or `None` for an empty range.
            ///
            /// Ranges may end exactly at the top of the address space, where an
            /// exclusive end would not be representable.
            #[inline]
            #[must_use]
            pub const fn last(self) -> Option<$addr> {
                if self.len == 0 {
                    None
                } else {
                    self.base.checked_add(self.len - 1)
                }
            }

            /// Exclusive end, or `None` if it would wrap past `u64::MAX`.
            #[inline]
            #[must_use]
            pub const fn end(self) -> Option<$addr> {
                self.base.checked_add(self.len)
            }

            /// Number of 4 KiB pages covered, rounding partial pages up.
            #[inline]
            #[must_use]
            pub const fn pages(self) -> u64 {
                self.len.div_ceil(Size4K::SIZE)
            }

            /// Base and length are both multiples of `align`.
            #[inline]
            #[must_use]
            pub const fn is_aligned_to(self, align: u64) -> bool {
                self.base.is_aligned_to(align) && self.len & (align - 1) == 0
            }

            #[inline]
            #[must_use]
            pub const fn is_page_aligned(self) -> bool {
                self.is_aligned_to(Size4K::SIZE)
            }

            #[inline]
            #[must_use]
            pub fn contains(self, addr: $addr) -> bool {
                match self.last() {
                    Some(last) => addr >= self.base && addr <= last,
                    None => false,
                }
            }

            /// `other` lies entirely inside `self`. Empty ranges are never contained.
            #[inline]
            #[must_use]
            pub fn contains_range(self, other: Self) -> bool {
                match (self.last(), other.last()) {
                    (Some(last), Some(other_last)) => {
                        other.base >= self.base && other_last <= last
                    }
                    _ => false,
                }
            }

            #[inline]
            #[must_use]
            pub fn overlaps(self, other: Self) -> bool {
                match (self.last(), other.last()) {
                    (Some(last), Some(other_last)) => {
                        self.base <= other_last && other.base <= last
                    }
                    _ => false,
                }
            }

            /// Byte offset of `addr` from the start of the range.
            #[inline]
            #[must_use]
            pub fn offset_of(self, addr: $addr) -> Option<u64> {
                if self.contains(addr) {
                    Some(addr - self.base)
                } else {
                    None
                }
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}[{} +{:#x}]", stringify!($name), self.base, self.len)
            }
        }
    };
}

address_range!(
    /// A span of physical memory: `len` bytes starting at `base`.
    ///
    /// This is a plain descriptor. Ownership of allocated frames is tracked by
    /// the move-only handle the frame allocator hands out.
    PhysicalRange,
    PhysicalAddress
);

address_range!(
    /// A span of virtual memory: `len` bytes starting at `base`.
    VirtualRange,
    VirtualAddress
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_touching_the_top_of_the_address_space() {
        let top = VirtualRange::new(VirtualAddress::new(0xFFFF_FFFF_A000_0000), 0x6000_0000);
        assert_eq!(top.end(), None);
        assert_eq!(top.last(), Some(VirtualAddress::new(u64::MAX)));
        assert!(top.contains(VirtualAddress::new(u64::MAX)));
        assert!(top.contains_range(VirtualRange::new(VirtualAddress::new(u64::MAX - 0xFFF), 0x1000)));
    }

    #[test]
    fn empty_ranges_contain_nothing() {
        let r = PhysicalRange::new(PhysicalAddress::new(0x1000), 0);
        assert!(r.is_empty());
        assert!(!r.contains(PhysicalAddress::new(0x1000)));
        let outer = PhysicalRange::new(PhysicalAddress::zero(), 0x10_000);
        assert!(!outer.contains_range(r));
    }

    #[test]
    fn overlap_and_alignment() {
        let a = PhysicalRange::new(PhysicalAddress::new(0x1000), 0x2000);
        let b = PhysicalRange::new(PhysicalAddress::new(0x2000), 0x1000);
        let c = PhysicalRange::new(PhysicalAddress::new(0x3000), 0x1000);
        assert!(a.overlaps(b));
        assert!(!a.overlaps(c));
        assert!(a.is_page_aligned());
        assert!(!PhysicalRange::new(PhysicalAddress::new(0x1000), 0x800).is_page_aligned());
        assert_eq!(a.pages(), 2);
        assert_eq!(a.offset_of(PhysicalAddress::new(0x2800)), Some(0x1800));
    }
}
