//! # Direct-Map `PhysMapper` for the Kernel
//!
//! Once the kernel windows are seeded, every physical address `pa` inside
//! the direct map is visible at `DIRECT_MAP_BASE + pa`. Page-table frames,
//! allocator storage and large heap blocks are all touched through it.
//!
//! ## Example
//! ```rust
//! use kernel_alloc::phys_mapper::DirectMapPhysMapper;
//! use kernel_memory_addresses::PhysicalAddress;
//! use kernel_vmem::PhysMapper;
//!
//! let mapper = DirectMapPhysMapper;
//! let va = mapper.phys_to_virt(PhysicalAddress::new(0x1234_0000));
//! assert_eq!(mapper.virt_to_phys(va), Some(PhysicalAddress::new(0x1234_0000)));
//! ```

use kernel_info::memory::{DIRECT_MAP_BASE, DIRECT_MAP_SIZE};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] over the kernel's direct map.
///
/// # Safety
/// Dereferencing what it returns is only sound after the direct map covering
/// the address has been installed and activated.
#[derive(Debug, Default, Copy, Clone)]
pub struct DirectMapPhysMapper;

impl PhysMapper for DirectMapPhysMapper {
    #[inline]
    fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        debug_assert!(pa.as_u64() < DIRECT_MAP_SIZE);
        VirtualAddress::new(DIRECT_MAP_BASE + pa.as_u64())
    }

    #[inline]
    fn virt_to_phys(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let offset = va.as_u64().checked_sub(DIRECT_MAP_BASE)?;
        (offset < DIRECT_MAP_SIZE).then(|| PhysicalAddress::new(offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_map_offsets_both_ways() {
        let mapper = DirectMapPhysMapper;
        let va = mapper.phys_to_virt(PhysicalAddress::new(0x20_1000));
        assert_eq!(va, VirtualAddress::new(0xffff_8880_0020_1000));
        assert_eq!(mapper.virt_to_phys(va), Some(PhysicalAddress::new(0x20_1000)));
    }

    #[test]
    fn addresses_outside_the_window_have_no_frame() {
        let mapper = DirectMapPhysMapper;
        assert_eq!(mapper.virt_to_phys(VirtualAddress::new(0x1000)), None);
        assert_eq!(mapper.virt_to_phys(VirtualAddress::new(DIRECT_MAP_BASE + DIRECT_MAP_SIZE)), None);
        assert_eq!(mapper.virt_to_phys(VirtualAddress::new(DIRECT_MAP_BASE)), Some(PhysicalAddress::zero()));
    }
}
