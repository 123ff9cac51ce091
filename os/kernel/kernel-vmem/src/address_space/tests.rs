use super::*;
use crate::test_support::{BumpAlloc, TestPhys};
use kernel_info::memory::KERNEL_HEAP_BASE;

const FRAMES: usize = 64;
const USER_VA: u64 = 0x0000_0000_4000_0000;

fn heap_window() -> VirtualRange {
    VirtualRange::new(VirtualAddress::new(KERNEL_HEAP_BASE), 256 * 4096)
}

/// An empty space over `$frames` frames of test RAM; the root is frame 0.
macro_rules! space {
    ($phys:ident, $storage:ident, $alloc:ident, $space:ident, $frames:expr) => {
        let $phys = TestPhys::with_frames(FRAMES);
        let mut $storage = vec![0u64; VirtualRangeAlloc::storage_words(heap_window())];
        let mut $alloc = BumpAlloc::new(0, $frames * 4096);
        let ranges = VirtualRangeAlloc::new(heap_window(), &mut $storage).unwrap();
        #[allow(unused_mut)]
        let mut $space = AddressSpace::new(&$phys, &mut $alloc, ranges).unwrap();
    };
}

fn va(v: u64) -> VirtualAddress {
    VirtualAddress::new(v)
}

fn pa(p: u64) -> PhysicalAddress {
    PhysicalAddress::new(p)
}

#[test]
fn map_one_4k_creates_tables_and_leaf() {
    space!(phys, storage, alloc, space, FRAMES as u64);
    let flags = PageEntry::kernel_rw();
    let target = va(0xFFFF_8000_0000_0000);

    space.map_page(&mut alloc, target, pa(0x30_0000), PageLevel::Pt, flags).unwrap();

    // Root, PDPT, PD, PT.
    assert_eq!(alloc.allocated(), 4);
    let pdpt = space.child_table(space.root_page(), PageLevel::Pml4, 256).unwrap();
    let pd = space.child_table(pdpt, PageLevel::Pdpt, 0).unwrap();
    let pt = space.child_table(pd, PageLevel::Pd, 0).unwrap();
    assert_ne!(pdpt, pd);
    assert_ne!(pd, pt);

    let t = space.translate(target + 0x123).unwrap();
    assert_eq!(t.physical, pa(0x30_0123));
    assert_eq!(t.level, PageLevel::Pt);
    assert!(t.flags.present() && t.flags.writable() && t.flags.no_execute());
    assert!(!t.flags.user() && !t.flags.huge_page());
}

#[test]
fn mapping_a_present_page_fails_and_keeps_the_original() {
    space!(phys, storage, alloc, space, FRAMES as u64);
    let target = va(USER_VA);
    space.map_page(&mut alloc, target, pa(0x5000), PageLevel::Pt, PageEntry::user_rw()).unwrap();

    assert_eq!(
        space.map_page(&mut alloc, target, pa(0x9000), PageLevel::Pt, PageEntry::kernel_rw()),
        Err(MapError::AlreadyExists)
    );
    let t = space.translate(target).unwrap();
    assert_eq!(t.physical, pa(0x5000));
    assert!(t.flags.user());
}

#[test]
fn huge_pages_translate_with_offset_and_block_smaller_maps() {
    space!(phys, storage, alloc, space, FRAMES as u64);
    let base = va(USER_VA);
    space
        .map_page(&mut alloc, base, pa(0x0060_0000), PageLevel::Pd, PageEntry::user_rw())
        .unwrap();

    let t = space.translate(base + 0x1_2345).unwrap();
    assert_eq!(t.level, PageLevel::Pd);
    assert_eq!(t.physical, pa(0x0061_2345));
    assert!(t.flags.huge_page());

    assert_eq!(
        space.map_page(&mut alloc, base + 0x1000, pa(0x1000), PageLevel::Pt, PageEntry::user_rw()),
        Err(MapError::AlreadyExists)
    );
    assert!(matches!(
        space.map_page(&mut alloc, base + 0x1000, pa(0x0060_0000), PageLevel::Pd, PageEntry::user_rw()),
        Err(MapError::InvalidArgument(_))
    ));
    assert!(matches!(
        space.map_page(&mut alloc, base, pa(0), PageLevel::Pml4, PageEntry::user_rw()),
        Err(MapError::InvalidArgument(_))
    ));
}

#[test]
fn range_map_is_all_or_nothing_on_conflict() {
    space!(phys, storage, alloc, space, FRAMES as u64);
    let base = va(USER_VA);
    space
        .map_page(&mut alloc, base + 2 * 4096, pa(0x8000), PageLevel::Pt, PageEntry::user_rw())
        .unwrap();

    let virt = VirtualRange::new(base, 4 * 4096);
    let phys_range = PhysicalRange::new(pa(0x10_0000), 4 * 4096);
    assert_eq!(
        space.map(&mut alloc, virt, phys_range, PageEntry::user_rw()),
        Err(MapError::AlreadyExists)
    );
    assert_eq!(space.translate(base), Err(MapError::NotFound));
    assert_eq!(space.translate(base + 4096), Err(MapError::NotFound));
    assert_eq!(space.translate(base + 2 * 4096).unwrap().physical, pa(0x8000));
}

#[test]
fn failed_map_leaves_no_empty_tables() {
    // Root, PDPT and PD fit; the PT for the first page does not.
    space!(phys, storage, alloc, space, 3);
    let virt = VirtualRange::new(va(USER_VA), 4096);
    let phys_range = PhysicalRange::new(pa(0x10_0000), 4096);

    assert_eq!(
        space.map(&mut alloc, virt, phys_range, PageEntry::user_rw()),
        Err(MapError::OutOfMemory)
    );
    assert_eq!(space.translate(va(USER_VA)), Err(MapError::NotFound));
    // The PD made for the page went back and is unlinked; the PDPT stays.
    assert_eq!(alloc.freed, vec![PhysicalPage::containing(pa(2 * 4096))]);
    let pdpt = space.child_table(space.root_page(), PageLevel::Pml4, 0).unwrap();
    assert_eq!(space.child_table(pdpt, PageLevel::Pdpt, 1), Err(MapError::NotFound));

    // Same through the huge-page aware path.
    assert_eq!(
        space.map_region(&mut alloc, virt, phys_range, PageEntry::user_rw(), PageLevel::Pd),
        Err(MapError::OutOfMemory)
    );
    assert_eq!(space.child_table(pdpt, PageLevel::Pdpt, 1), Err(MapError::NotFound));
}

#[test]
fn range_map_rolls_back_when_tables_run_out() {
    // Root, PDPT, PD and one PT fit; the second PT does not.
    space!(phys, storage, alloc, space, 4);
    let base = va(USER_VA + 0x20_0000 - 2 * 4096);
    let virt = VirtualRange::new(base, 4 * 4096);
    let phys_range = PhysicalRange::new(pa(0x10_0000), 4 * 4096);

    assert_eq!(
        space.map(&mut alloc, virt, phys_range, PageEntry::user_rw()),
        Err(MapError::OutOfMemory)
    );
    for i in 0..4 {
        assert_eq!(space.translate(base + i * 4096), Err(MapError::NotFound));
    }
    // The emptied PT and PD went back; the PDPT stays linked.
    assert_eq!(alloc.freed.len(), 2);
    assert!(space.child_table(space.root_page(), PageLevel::Pml4, 0).is_ok());
}

#[test]
fn range_map_validates_its_arguments() {
    space!(phys, storage, alloc, space, FRAMES as u64);
    let flags = PageEntry::user_rw();
    let cases = [
        (VirtualRange::new(va(USER_VA), 4096), PhysicalRange::new(pa(0), 8192)),
        (VirtualRange::new(va(USER_VA), 0), PhysicalRange::new(pa(0), 0)),
        (VirtualRange::new(va(USER_VA + 1), 4096), PhysicalRange::new(pa(0), 4096)),
        (VirtualRange::new(va(0x0000_8000_0000_0000), 4096), PhysicalRange::new(pa(0), 4096)),
    ];
    for (virt, phys_range) in cases {
        assert!(matches!(
            space.map(&mut alloc, virt, phys_range, flags),
            Err(MapError::InvalidArgument(_))
        ));
    }
    assert_eq!(alloc.allocated(), 1);
}

#[test]
fn unmap_reports_bytes_and_reclaims_empty_tables() {
    space!(phys, storage, alloc, space, FRAMES as u64);
    let base = va(USER_VA);
    let flags = PageEntry::user_rw();
    space.map_page(&mut alloc, base, pa(0x1000), PageLevel::Pt, flags).unwrap();
    space.map_page(&mut alloc, base + 8 * 4096, pa(0x2000), PageLevel::Pt, flags).unwrap();

    assert_eq!(space.unmap(&mut alloc, VirtualRange::new(base, 16 * 4096)), Ok(8192));
    assert_eq!(space.translate(base), Err(MapError::NotFound));
    assert_eq!(alloc.freed.len(), 2);
    assert!(space.child_table(space.root_page(), PageLevel::Pml4, 0).is_ok());

    // Nothing left to unmap.
    assert_eq!(space.unmap(&mut alloc, VirtualRange::new(base, 16 * 4096)), Ok(0));
}

#[test]
fn unmap_keeps_tables_that_still_hold_entries() {
    space!(phys, storage, alloc, space, FRAMES as u64);
    let base = va(USER_VA);
    let flags = PageEntry::user_rw();
    space.map_page(&mut alloc, base, pa(0x1000), PageLevel::Pt, flags).unwrap();
    space.map_page(&mut alloc, base + 4096, pa(0x2000), PageLevel::Pt, flags).unwrap();

    assert_eq!(space.unmap(&mut alloc, VirtualRange::new(base, 4096)), Ok(4096));
    assert!(alloc.freed.is_empty());
    assert_eq!(space.translate(base + 4096).unwrap().physical, pa(0x2000));
}

#[test]
fn unmap_refuses_to_split_huge_pages() {
    space!(phys, storage, alloc, space, FRAMES as u64);
    let base = va(USER_VA);
    space
        .map_page(&mut alloc, base, pa(0x0020_0000), PageLevel::Pd, PageEntry::user_rw())
        .unwrap();

    assert!(matches!(
        space.unmap(&mut alloc, VirtualRange::new(base, 4096)),
        Err(MapError::InvalidArgument(_))
    ));
    assert!(space.translate(base).is_ok());

    assert_eq!(space.unmap(&mut alloc, VirtualRange::new(base, 0x20_0000)), Ok(0x20_0000));
    assert_eq!(space.translate(base), Err(MapError::NotFound));
}

#[test]
fn map_region_uses_the_largest_fitting_pages() {
    space!(phys, storage, alloc, space, FRAMES as u64);
    let base = va(USER_VA);
    let virt = VirtualRange::new(base, 0x20_0000 + 4096);
    let phys_range = PhysicalRange::new(pa(0x0020_0000), 0x20_0000 + 4096);

    space
        .map_region(&mut alloc, virt, phys_range, PageEntry::user_rw(), PageLevel::Pdpt)
        .unwrap();

    assert_eq!(space.translate(base).unwrap().level, PageLevel::Pd);
    let tail = space.translate(base + 0x20_0000).unwrap();
    assert_eq!(tail.level, PageLevel::Pt);
    assert_eq!(tail.physical, pa(0x0040_0000));

    assert_eq!(space.unmap(&mut alloc, virt), Ok(virt.len()));
}

#[test]
fn kernel_windows_are_seeded_once() {
    space!(phys, storage, alloc, space, FRAMES as u64);
    let layout = KernelLayout {
        physical_memory: PhysicalRange::new(pa(0x0010_0000), 32 * 1024 * 1024),
        kernel_image: Some(PhysicalRange::new(pa(0x0010_0000), 16 * 4096)),
    };
    space.init_kernel_windows(&mut alloc, &layout).unwrap();

    let low = space.translate(va(DIRECT_MAP_BASE + 0x0010_0000)).unwrap();
    assert_eq!(low.physical, pa(0x0010_0000));
    assert_eq!(low.level, PageLevel::Pt);
    assert!(low.flags.no_execute() && low.flags.global());

    let mid = space.translate(va(DIRECT_MAP_BASE + 0x0040_0000 + 0x10)).unwrap();
    assert_eq!(mid.level, PageLevel::Pd);
    assert_eq!(mid.physical, pa(0x0040_0010));

    let code = space.translate(va(KERNEL_BASE + 0x1000)).unwrap();
    assert_eq!(code.physical, pa(0x0010_1000));
    assert!(!code.flags.no_execute());

    let root = space.root_page();
    assert!(space.child_table(root, PageLevel::Pml4, pml4_index(KERNEL_HEAP_BASE)).is_ok());
    assert!(space.child_table(root, PageLevel::Pml4, 511).is_ok());
    assert_eq!(space.child_table(root, PageLevel::Pml4, 0), Err(MapError::NotFound));
    assert_eq!(space.translate(va(KERNEL_HEAP_BASE)), Err(MapError::NotFound));

    assert_eq!(space.init_kernel_windows(&mut alloc, &layout), Err(MapError::AlreadyExists));
}

#[test]
fn reservations_go_through_the_managed_window() {
    space!(phys, storage, alloc, space, FRAMES as u64);
    let r = space.reserve(None, 4, PageEntry::kernel_rw()).unwrap();
    assert!(heap_window().contains_range(r.range()));
    assert_eq!(space.ranges().reserved_pages(), 4);

    // Reserving does not map.
    assert_eq!(space.translate(r.base()), Err(MapError::NotFound));
    space.release(r).unwrap();
    assert_eq!(space.ranges().reserved_pages(), 0);
    assert!(!space.is_active());
}
