//! # Boot Memory Map
//!
//! The boot-protocol layer translates whatever the firmware or bootloader
//! reports into an ordered slice of [`MemoryRegion`] records. The memory
//! subsystem only ever looks at this normalized form.

use kernel_memory_addresses::{PhysicalAddress, PhysicalRange};

use crate::memory::PAGE_SIZE;

/// Classification of a physical memory region reported at boot.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemoryRegionKind {
    /// Free RAM the kernel may hand out.
    Usable = 0,
    Reserved = 1,
    /// ACPI tables; reclaimable once parsed.
    AcpiReclaimable = 2,
    AcpiNvs = 3,
    BadMemory = 4,
    /// Bootloader data; reclaimable once the kernel no longer needs it.
    BootloaderReclaimable = 5,
    /// The kernel image and any boot modules.
    KernelAndModules = 6,
    Framebuffer = 7,
}

/// One record of the boot memory map.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: MemoryRegionKind) -> Self {
        Self { base, length, kind }
    }

    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self.kind, MemoryRegionKind::Usable)
    }

    /// Exclusive end, saturating at `u64::MAX`.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }
}

/// Merge consecutive `Usable` records that touch or overlap and return the
/// largest resulting span, trimmed inward to page boundaries.
///
/// Records are expected in ascending base order. Any non-usable record
/// between two usable ones breaks contiguity. Returns `None` if the map has
/// no usable page at all.
#[must_use]
pub fn largest_usable_span(regions: &[MemoryRegion]) -> Option<PhysicalRange> {
    let mut best: Option<(u64, u64)> = None;
    let mut current: Option<(u64, u64)> = None;

    let mut consider = |span: (u64, u64)| {
        let (start, end) = trim_to_pages(span);
        if end > start && best.is_none_or(|(s, e)| end - start > e - s) {
            best = Some((start, end));
        }
    };

    for region in regions.iter().filter(|r| r.length > 0) {
        if !region.is_usable() {
            if let Some(span) = current.take() {
                consider(span);
            }
            continue;
        }

        current = match current {
            Some((start, end)) if region.base <= end => Some((start, end.max(region.end()))),
            Some(span) => {
                consider(span);
                Some((region.base, region.end()))
            }
            None => Some((region.base, region.end())),
        };
    }
    if let Some(span) = current {
        consider(span);
    }

    best.map(|(start, end)| PhysicalRange::new(PhysicalAddress::new(start), end - start))
}

fn trim_to_pages((start, end): (u64, u64)) -> (u64, u64) {
    let start = start.div_ceil(PAGE_SIZE).saturating_mul(PAGE_SIZE);
    let end = end - end % PAGE_SIZE;
    (start, end.max(start))
}

#[cfg(test)]
mod tests {
    use super::*;
    use MemoryRegionKind::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn adjacent_usable_records_merge() {
        let map = [
            MemoryRegion::new(0, 0x9_F000, Usable),
            MemoryRegion::new(0x9_F000, 0x6_1000, Reserved),
            MemoryRegion::new(0x10_0000, 16 * MIB, Usable),
            MemoryRegion::new(0x10_0000 + 16 * MIB, 8 * MIB, Usable),
            MemoryRegion::new(0x10_0000 + 24 * MIB, MIB, AcpiNvs),
        ];
        let span = largest_usable_span(&map).unwrap();
        assert_eq!(span.base().as_u64(), 0x10_0000);
        assert_eq!(span.len(), 24 * MIB);
    }

    #[test]
    fn non_usable_record_breaks_contiguity() {
        let map = [
            MemoryRegion::new(0x10_0000, 4 * MIB, Usable),
            MemoryRegion::new(0x10_0000 + 4 * MIB, 0, KernelAndModules),
            MemoryRegion::new(0x10_0000 + 4 * MIB, MIB, KernelAndModules),
            MemoryRegion::new(0x10_0000 + 5 * MIB, 6 * MIB, Usable),
        ];
        let span = largest_usable_span(&map).unwrap();
        assert_eq!(span.base().as_u64(), 0x10_0000 + 5 * MIB);
        assert_eq!(span.len(), 6 * MIB);
    }

    #[test]
    fn spans_are_trimmed_to_pages() {
        let map = [MemoryRegion::new(0x1_0800, 0x3000, Usable)];
        let span = largest_usable_span(&map).unwrap();
        assert_eq!(span.base().as_u64(), 0x1_1000);
        assert_eq!(span.len(), 0x2000);
    }

    #[test]
    fn no_usable_memory() {
        let map = [MemoryRegion::new(0, MIB, Reserved), MemoryRegion::new(MIB, 0x800, Usable)];
        assert!(largest_usable_span(&map).is_none());
    }
}
