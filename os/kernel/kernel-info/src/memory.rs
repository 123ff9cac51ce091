//! # Memory Layout
//!
//! Fixed virtual windows of the kernel address space. Every window is a whole
//! number of 4 KiB pages and none of them overlap; the `const` block at the
//! bottom refuses to compile otherwise.

/// Base page granularity of every allocator.
pub const PAGE_SIZE: u64 = 4096;

/// Bytes covered by one top-level (PML4) entry.
pub const PML4_ENTRY_SPAN: u64 = 512 * 1024 * 1024 * 1024;

/// Lower half, owned by user processes. Empty in the kernel address space.
pub const USER_BASE: u64 = 0;

/// Size of the user window (128 TiB, the whole canonical lower half).
pub const USER_SIZE: u64 = 0x0000_8000_0000_0000;

/// Direct map: physical address `pa` is visible at `DIRECT_MAP_BASE + pa`.
pub const DIRECT_MAP_BASE: u64 = 0xffff_8880_0000_0000;

/// 64 TiB of directly mapped physical memory.
pub const DIRECT_MAP_SIZE: u64 = 64 * 1024 * 1024 * 1024 * 1024;

/// Window the kernel heap grows into.
pub const KERNEL_HEAP_BASE: u64 = 0xffff_c900_0000_0000;

/// 4 GiB
pub const KERNEL_HEAP_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Where the kernel executes (VMA), matches the linker script.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// 512 MiB reserved for the kernel core image.
pub const KERNEL_IMAGE_SIZE: u64 = 512 * 1024 * 1024;

/// Loadable kernel modules live directly above the core image.
pub const KERNEL_MODULES_BASE: u64 = KERNEL_BASE + KERNEL_IMAGE_SIZE;

/// 1.5 GiB, ending at the very top of the address space.
pub const KERNEL_MODULES_SIZE: u64 = 1536 * 1024 * 1024;

/// Where the kernel image is placed in *physical* memory (LMA) before paging.
pub const PHYS_LOAD: u64 = 0x0010_0000; // 1 MiB

/// Boot refuses to continue if the largest usable span is smaller than this.
pub const MIN_USABLE_SPAN: u64 = 16 * 1024 * 1024;

/// Number of per-CPU active-slab slots in each slab size class.
pub const MAX_CPUS: usize = 16;

/// A named, fixed window of the virtual address space.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RegionWindow {
    pub name: &'static str,
    pub base: u64,
    pub size: u64,
}

impl RegionWindow {
    /// Last byte inside the window. Windows may end at `u64::MAX`.
    #[must_use]
    pub const fn last(&self) -> u64 {
        self.base + (self.size - 1)
    }

    /// Index of the first PML4 slot the window touches.
    #[must_use]
    pub const fn first_pml4_index(&self) -> usize {
        pml4_index(self.base)
    }

    /// Index of the last PML4 slot the window touches.
    #[must_use]
    pub const fn last_pml4_index(&self) -> usize {
        pml4_index(self.last())
    }
}

pub const USER_WINDOW: RegionWindow = RegionWindow {
    name: "user",
    base: USER_BASE,
    size: USER_SIZE,
};

pub const DIRECT_MAP_WINDOW: RegionWindow = RegionWindow {
    name: "direct-map",
    base: DIRECT_MAP_BASE,
    size: DIRECT_MAP_SIZE,
};

pub const KERNEL_HEAP_WINDOW: RegionWindow = RegionWindow {
    name: "kernel-heap",
    base: KERNEL_HEAP_BASE,
    size: KERNEL_HEAP_SIZE,
};

pub const KERNEL_IMAGE_WINDOW: RegionWindow = RegionWindow {
    name: "kernel-image",
    base: KERNEL_BASE,
    size: KERNEL_IMAGE_SIZE,
};

pub const KERNEL_MODULES_WINDOW: RegionWindow = RegionWindow {
    name: "kernel-modules",
    base: KERNEL_MODULES_BASE,
    size: KERNEL_MODULES_SIZE,
};

/// All windows, ordered by base address.
pub const REGION_WINDOWS: [RegionWindow; 5] = [
    USER_WINDOW,
    DIRECT_MAP_WINDOW,
    KERNEL_HEAP_WINDOW,
    KERNEL_IMAGE_WINDOW,
    KERNEL_MODULES_WINDOW,
];

/// PML4 slot selected by bits 47..=39 of `va`.
#[must_use]
pub const fn pml4_index(va: u64) -> usize {
    ((va >> 39) & 0x1FF) as usize
}

const _: () = {
    let mut i = 0;
    while i < REGION_WINDOWS.len() {
        let w = REGION_WINDOWS[i];
        assert!(w.base.is_multiple_of(PAGE_SIZE));
        assert!(w.size.is_multiple_of(PAGE_SIZE));
        if i > 0 {
            assert!(REGION_WINDOWS[i - 1].last() < w.base);
        }
        i += 1;
    }
    assert!(KERNEL_MODULES_WINDOW.last() == u64::MAX);
    assert!(DIRECT_MAP_SIZE.is_multiple_of(PML4_ENTRY_SPAN));
    assert!(KERNEL_HEAP_WINDOW.first_pml4_index() == KERNEL_HEAP_WINDOW.last_pml4_index());
    assert!(MIN_USABLE_SPAN.is_multiple_of(PAGE_SIZE));
};
