//! # Virtual and Physical Memory Address Types
//!
//! Zero-cost wrappers that keep physical and virtual addresses apart at
//! compile time.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | Machine addresses and page frames |
//! | [`VirtualAddress`] / [`VirtualPage<S>`] | Page-table translated addresses |
//! | [`PhysicalRange`] / [`VirtualRange`] | `base + len` spans used by the allocators |
//!
//! Page sizes are the marker types [`Size4K`], [`Size2M`] and [`Size1G`],
//! which implement [`PageSize`].
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xFFFF_FFFF_8000_1234);
//! assert_eq!(va.page::<Size4K>().base().as_u64(), 0xFFFF_FFFF_8000_1000);
//! assert_eq!(va.offset::<Size4K>(), 0x234);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

mod page;
mod page_size;
mod physical_address;
mod range;
mod virtual_address;

pub use crate::page::{PhysicalPage, VirtualPage};
pub use crate::page_size::{PageSize, Size1G, Size2M, Size4K};
pub use crate::physical_address::PhysicalAddress;
pub use crate::range::{PhysicalRange, VirtualRange};
pub use crate::virtual_address::VirtualAddress;

/// Round `x` down to a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_down(x: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    x & !(align - 1)
}

/// Round `x` up to a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_up(x: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (x + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_down(0x1234, 0x1000), 0x1000);
        assert_eq!(align_up(0x1234, 0x1000), 0x2000);
        assert_eq!(align_up(0x2000, 0x1000), 0x2000);
        assert_eq!(align_up(0, 0x1000), 0);
    }

    #[test]
    fn pages_round_down_to_their_base() {
        let pa = PhysicalAddress::new(0x20_1234);
        assert_eq!(pa.page::<Size4K>().base(), PhysicalAddress::new(0x20_1000));
        assert_eq!(pa.page::<Size2M>().base(), PhysicalAddress::new(0x20_0000));
        assert_eq!(pa.page::<Size4K>().number(), 0x201);
        assert!(PhysicalPage::<Size4K>::from_start(pa).is_none());
    }

    #[test]
    fn canonical_addresses() {
        assert!(VirtualAddress::new(0x0000_7FFF_FFFF_F000).is_canonical());
        assert!(VirtualAddress::new(0xFFFF_8000_0000_0000).is_canonical());
        assert!(!VirtualAddress::new(0x0000_8000_0000_0000).is_canonical());
    }
}
