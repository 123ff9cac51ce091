//! # Address Space (x86-64, PML4-rooted)
//!
//! One page-table hierarchy plus the bookkeeping of which virtual pages in
//! its managed window are reserved.
//!
//! ## Operations
//!
//! - [`AddressSpace::child_table`] / [`AddressSpace::ensure_child_table`]
//!   resolve the table below a non-leaf entry, optionally creating it.
//! - [`AddressSpace::map_page`] installs one 4 KiB, 2 MiB or 1 GiB leaf.
//! - [`AddressSpace::map`] maps a virtual range onto a physical range of the
//!   same size with 4 KiB leaves, all or nothing.
//! - [`AddressSpace::map_region`] does the same with the largest page size
//!   that fits at each step.
//! - [`AddressSpace::unmap`] clears leaves, invalidates the TLB when the space
//!   is active, and frees page tables and directories that become empty.
//! - [`AddressSpace::translate`] walks the tables for one address.
//! - [`AddressSpace::reserve`] / [`AddressSpace::release`] manage virtual
//!   ranges without touching the tables.
//! - [`AddressSpace::init_kernel_windows`] seeds the fixed kernel windows.
//! - [`AddressSpace::activate`] loads CR3.
//!
//! ## Ownership
//!
//! A present non-leaf entry owns the frame of its child table. Frames behind
//! leaf entries belong to whoever mapped them; unmapping never frees them.
//! PDPT frames are never reclaimed: the top-level entries of the kernel
//! windows must stay stable so they can be shared.

use crate::ranges::{VirtualRangeAlloc, VirtualReservation};
use crate::{FrameAlloc, MapError, PageEntry, PageFlags, PageLevel, PageTable, PhysMapper, tlb};
use kernel_info::memory::{
    DIRECT_MAP_BASE, DIRECT_MAP_SIZE, KERNEL_BASE, KERNEL_HEAP_WINDOW, KERNEL_IMAGE_SIZE,
    KERNEL_IMAGE_WINDOW, KERNEL_MODULES_WINDOW, USER_SIZE, pml4_index,
};
use kernel_memory_addresses::{
    PageSize, PhysicalAddress, PhysicalPage, PhysicalRange, Size4K, VirtualAddress, VirtualRange,
};
use kernel_registers::cr3::Cr3;
use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use kernel_sync::IrqGuard;
use log::{info, trace};

/// The PML4 root page for an [`AddressSpace`].
pub type RootPage = PhysicalPage<Size4K>;

/// Outcome of a successful [`AddressSpace::translate`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Translation {
    pub physical: PhysicalAddress,
    /// Level of the leaf entry (`Pt` for 4 KiB pages).
    pub level: PageLevel,
    pub flags: PageFlags,
}

/// What the kernel windows are seeded with.
#[derive(Debug, Copy, Clone)]
pub struct KernelLayout {
    /// Physical memory made visible through the direct map.
    pub physical_memory: PhysicalRange,
    /// Where the loader put the kernel image, mapped at `KERNEL_BASE`.
    pub kernel_image: Option<PhysicalRange>,
}

/// Where a walk for one address stopped.
#[derive(Copy, Clone)]
struct Walk {
    /// `(table, index)` visited per level, indexed by `level as usize - 1`.
    path: [Option<(RootPage, usize)>; 4],
    /// Level of the leaf, or of the first non-present entry.
    level: PageLevel,
    entry: PageEntry,
}

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: RootPage,
    mapper: &'m M,
    ranges: VirtualRangeAlloc<'m>,
    active: bool,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// A fresh, empty address space with a zeroed root table.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if no frame is available for the root.
    pub fn new<A: FrameAlloc>(
        mapper: &'m M,
        alloc: &mut A,
        ranges: VirtualRangeAlloc<'m>,
    ) -> Result<Self, MapError> {
        let root = alloc.alloc_4k().ok_or(MapError::OutOfMemory)?;
        let space = Self::from_root(mapper, root, ranges);
        space.table(root).zero();
        Ok(space)
    }

    /// Wrap an existing root table.
    #[inline]
    #[must_use]
    pub const fn from_root(mapper: &'m M, root: RootPage, ranges: VirtualRangeAlloc<'m>) -> Self {
        Self {
            root,
            mapper,
            ranges,
            active: false,
        }
    }

    /// View the **currently active** address space by reading CR3.
    ///
    /// # Safety
    /// - Must run at CPL0 with paging enabled.
    /// - CR3 must point at a valid PML4 reachable through `mapper`.
    #[inline]
    #[must_use]
    pub unsafe fn from_current(mapper: &'m M, ranges: VirtualRangeAlloc<'m>) -> Self {
        let root = unsafe { Cr3::load_unsafe() }.root();
        Self {
            root,
            mapper,
            ranges,
            active: true,
        }
    }

    /// Load CR3 with this space's root, with interrupts withheld.
    ///
    /// # Safety
    /// The code, stack and data in use must be mapped identically in this
    /// space.
    #[inline]
    pub unsafe fn activate(&mut self) {
        let _irq = IrqGuard::new();
        unsafe { Cr3::with_root(self.root).store_unsafe() };
        self.active = true;
        info!("activated address space rooted at {}", self.root.base());
    }

    #[inline]
    #[must_use]
    pub const fn root_page(&self) -> RootPage {
        self.root
    }

    /// Whether this space is loaded in CR3 (mapping changes need TLB work).
    #[inline]
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }

    #[inline]
    #[must_use]
    pub const fn ranges(&self) -> &VirtualRangeAlloc<'m> {
        &self.ranges
    }

    /// Borrow a table frame through the physical mapper.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    fn table(&self, page: RootPage) -> &mut PageTable {
        // SAFETY: every page handed in is a table frame of this space, and
        // callers never hold two borrows of the same frame.
        unsafe { self.mapper.phys_to_mut::<PageTable>(page.base()) }
    }

    /// The table below entry `index` of the `level` table at `parent`.
    ///
    /// # Errors
    /// - [`MapError::NotFound`] if the entry is not present.
    /// - [`MapError::AlreadyExists`] if the entry is a huge-page leaf.
    /// - [`MapError::InvalidArgument`] for `level == Pt` or `index >= 512`.
    pub fn child_table(&self, parent: RootPage, level: PageLevel, index: usize) -> Result<RootPage, MapError> {
        if level.lower().is_none() {
            return Err(MapError::InvalidArgument("page tables have no child tables"));
        }
        if index >= crate::table::ENTRIES {
            return Err(MapError::InvalidArgument("table index out of range"));
        }

        let entry = self.table(parent).get(index);
        if !entry.present() {
            return Err(MapError::NotFound);
        }
        if entry.huge_page() && level.supports_leaf() {
            return Err(MapError::AlreadyExists);
        }
        Ok(entry.frame_page())
    }

    /// Like [`child_table`](Self::child_table), but allocates, zeroes and
    /// links a new table when the entry is absent.
    ///
    /// # Errors
    /// - [`MapError::OutOfMemory`] if `alloc` has no frame left.
    /// - Any error of [`child_table`](Self::child_table) other than `NotFound`.
    pub fn ensure_child_table<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        parent: RootPage,
        level: PageLevel,
        index: usize,
        link: PageFlags,
    ) -> Result<RootPage, MapError> {
        match self.child_table(parent, level, index) {
            Err(MapError::NotFound) => {}
            other => return other,
        }

        let child = alloc.alloc_4k().ok_or(MapError::OutOfMemory)?;
        self.table(child).zero();
        let entry = link
            .flags()
            .with_present(true)
            .with_huge_page(false)
            .with_physical_address(child.base());
        self.table(parent).set(index, entry);
        trace!("linked {level:?}[{index}] -> table {}", child.base());
        Ok(child)
    }

    /// The table at `leaf_level` that holds the entry for `va`, creating the
    /// chain above it as needed.
    fn leaf_table<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        va: VirtualAddress,
        leaf_level: PageLevel,
    ) -> Result<RootPage, MapError> {
        let link = PageEntry::table_link(is_user(va));
        let mut table = self.root;
        let mut level = PageLevel::Pml4;
        while level > leaf_level {
            table = self.ensure_child_table(alloc, table, level, level.index_of(va), link)?;
            let Some(lower) = level.lower() else { break };
            level = lower;
        }
        Ok(table)
    }

    fn walk(&self, va: VirtualAddress) -> Walk {
        let mut path = [None; 4];
        let mut table = self.root;
        let mut level = PageLevel::Pml4;
        loop {
            let index = level.index_of(va);
            path[level as usize - 1] = Some((table, index));
            let entry = self.table(table).get(index);
            let is_leaf = level == PageLevel::Pt || (entry.huge_page() && level.supports_leaf());
            let next = level.lower();
            match next {
                Some(lower) if entry.present() && !is_leaf => {
                    table = entry.frame_page();
                    level = lower;
                }
                _ => return Walk { path, level, entry },
            }
        }
    }

    /// Translate `va` through the tables.
    ///
    /// # Errors
    /// [`MapError::NotFound`] if `va` is not mapped.
    pub fn translate(&self, va: VirtualAddress) -> Result<Translation, MapError> {
        let walk = self.walk(va);
        if !walk.entry.present() {
            return Err(MapError::NotFound);
        }
        let span = walk.level.span();
        Ok(Translation {
            physical: walk.entry.physical_address().align_down(span) + (va.as_u64() & (span - 1)),
            level: walk.level,
            flags: walk.entry.flags(),
        })
    }

    /// Map one page of the size implied by `level` at `va -> pa`.
    ///
    /// # Errors
    /// - [`MapError::InvalidArgument`] for a PML4 level, a non-canonical
    ///   `va`, or addresses not aligned to the page size.
    /// - [`MapError::AlreadyExists`] if the slot (or a huge leaf above it)
    ///   is present.
    /// - [`MapError::OutOfMemory`] if an intermediate table cannot be allocated.
    pub fn map_page<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        level: PageLevel,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        if !level.supports_leaf() {
            return Err(MapError::InvalidArgument("PML4 entries cannot map memory"));
        }
        if !va.is_canonical() {
            return Err(MapError::InvalidArgument("non-canonical virtual address"));
        }
        let span = level.span();
        if !va.is_aligned_to(span) || !pa.is_aligned_to(span) {
            return Err(MapError::InvalidArgument("address not aligned to page size"));
        }

        let table = self.leaf_table(alloc, va, level)?;
        let leaf = flags.flags().with_huge_page(level != PageLevel::Pt);
        self.table(table).map(level.index_of(va), pa, leaf)?;
        trace!("mapped {va} -> {pa} ({level:?})");
        Ok(())
    }

    /// Map `virt` onto `phys` with 4 KiB pages.
    ///
    /// Either every page is mapped or none is: the span is checked for
    /// existing mappings before anything is written, and pages installed
    /// before a table allocation fails are rolled back.
    ///
    /// # Errors
    /// - [`MapError::InvalidArgument`] if the sizes differ, either range is
    ///   empty or not page aligned, or `virt` is not canonical.
    /// - [`MapError::AlreadyExists`] if any page of `virt` is mapped.
    /// - [`MapError::OutOfMemory`] if a page table cannot be allocated.
    pub fn map<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        virt: VirtualRange,
        phys: PhysicalRange,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        check_pair(virt, phys)?;

        let mut offset = 0;
        while offset < virt.len() {
            if self.translate(virt.base() + offset).is_ok() {
                return Err(MapError::AlreadyExists);
            }
            offset += Size4K::SIZE;
        }

        let mut done = 0;
        while done < virt.len() {
            let result = self.map_page(alloc, virt.base() + done, phys.base() + done, PageLevel::Pt, flags);
            if let Err(e) = result {
                self.roll_back(alloc, virt, done);
                return Err(e);
            }
            done += Size4K::SIZE;
        }
        Ok(())
    }

    /// Map `virt` onto `phys`, using leaves up to `largest` wherever both
    /// addresses are suitably aligned. Installed pages are rolled back on
    /// failure.
    ///
    /// # Errors
    /// As for [`map`](Self::map), except that existing mappings are detected
    /// while mapping rather than up front.
    pub fn map_region<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        virt: VirtualRange,
        phys: PhysicalRange,
        flags: PageFlags,
        largest: PageLevel,
    ) -> Result<(), MapError> {
        check_pair(virt, phys)?;

        let mut done = 0;
        while done < virt.len() {
            let va = virt.base() + done;
            let pa = phys.base() + done;
            let remaining = virt.len() - done;
            let level = [PageLevel::Pdpt, PageLevel::Pd]
                .into_iter()
                .filter(|l| *l <= largest)
                .find(|l| va.is_aligned_to(l.span()) && pa.is_aligned_to(l.span()) && remaining >= l.span())
                .unwrap_or(PageLevel::Pt);

            if let Err(e) = self.map_page(alloc, va, pa, level, flags) {
                self.roll_back(alloc, virt, done);
                return Err(e);
            }
            done += level.span();
        }
        Ok(())
    }

    /// Undo the first `done` bytes of `virt` after the page at `done` failed
    /// to map, along with any tables created for that page that stayed empty.
    fn roll_back<A: FrameAlloc>(&mut self, alloc: &mut A, virt: VirtualRange, done: u64) {
        if done > 0 {
            let undone = self.unmap(alloc, VirtualRange::new(virt.base(), done));
            debug_assert_eq!(undone, Ok(done));
        }
        let walk = self.walk(virt.base() + done);
        if !walk.entry.present() {
            self.reclaim_empty_tables(alloc, &walk);
        }
    }

    /// Unmap every page in `range` and return the number of bytes that were
    /// mapped. Unmapped holes are skipped. The frames behind the leaves are
    /// not freed; page tables and directories left empty are.
    ///
    /// # Errors
    /// [`MapError::InvalidArgument`] if `range` is empty, not page aligned,
    /// or covers only part of a huge page. Nothing is changed in that case.
    pub fn unmap<A: FrameAlloc>(&mut self, alloc: &mut A, range: VirtualRange) -> Result<u64, MapError> {
        if range.is_empty() || !range.is_page_aligned() {
            return Err(MapError::InvalidArgument("range empty or not page aligned"));
        }

        let mut offset = 0;
        while offset < range.len() {
            let va = range.base() + offset;
            let walk = self.walk(va);
            let span = walk.level.span();
            if walk.entry.present() && span > Size4K::SIZE && (!va.is_aligned_to(span) || range.len() - offset < span) {
                return Err(MapError::InvalidArgument("range covers part of a huge page"));
            }
            offset = next_offset(range, offset, va, &walk);
        }

        let mut unmapped = 0;
        let mut offset = 0;
        while offset < range.len() {
            let va = range.base() + offset;
            let walk = self.walk(va);
            if walk.entry.present() {
                self.clear_leaf(alloc, va, &walk);
                unmapped += walk.level.span();
            }
            offset = next_offset(range, offset, va, &walk);
        }

        trace!("unmapped {unmapped:#x} bytes in {range:?}");
        Ok(unmapped)
    }

    fn clear_leaf<A: FrameAlloc>(&mut self, alloc: &mut A, va: VirtualAddress, walk: &Walk) {
        if let Some((table, index)) = walk.path[walk.level as usize - 1] {
            self.table(table).clear(index);
        }
        if self.active {
            tlb::invalidate_page(va);
        }

        self.reclaim_empty_tables(alloc, walk);
    }

    /// Free the PT and PD frames on `walk` that hold no entries, bottom up.
    /// PDPTs stay.
    fn reclaim_empty_tables<A: FrameAlloc>(&mut self, alloc: &mut A, walk: &Walk) {
        for level in [PageLevel::Pt, PageLevel::Pd] {
            if level < walk.level {
                continue;
            }
            let Some((table, _)) = walk.path[level as usize - 1] else { break };
            let Some((parent, parent_index)) = walk.path[level as usize] else { break };
            if !self.table(table).is_empty() {
                break;
            }
            self.table(parent).clear(parent_index);
            alloc.free_4k(table);
            trace!("reclaimed empty {level:?} table {}", table.base());
        }
    }

    /// Reserve `pages` virtual pages in the managed window.
    ///
    /// # Errors
    /// See [`VirtualRangeAlloc::reserve`].
    pub fn reserve(
        &mut self,
        hint: Option<VirtualAddress>,
        pages: usize,
        flags: PageFlags,
    ) -> Result<VirtualReservation, MapError> {
        self.ranges.reserve(hint, pages, flags)
    }

    /// Give reserved pages back. Mappings inside them must be removed first.
    ///
    /// # Errors
    /// See [`VirtualRangeAlloc::release`].
    pub fn release(&mut self, reservation: VirtualReservation) -> Result<(), MapError> {
        self.ranges.release(reservation)
    }

    /// Seed the kernel half of a fresh space.
    ///
    /// - Links the top-level entries of the kernel-heap, kernel-image and
    ///   kernel-modules windows, and those of the direct map that cover
    ///   `layout.physical_memory`.
    /// - Maps that physical memory at `DIRECT_MAP_BASE + pa` with up to
    ///   2 MiB pages, and the kernel image at `KERNEL_BASE`.
    ///
    /// The user window stays empty. On failure the space is partially seeded
    /// and should be discarded.
    ///
    /// # Errors
    /// - [`MapError::AlreadyExists`] if any kernel-half entry is present.
    /// - [`MapError::InvalidArgument`] if physical memory is empty, exceeds
    ///   the direct map, or the image exceeds its window.
    /// - [`MapError::OutOfMemory`] if tables cannot be allocated.
    pub fn init_kernel_windows<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        layout: &KernelLayout,
    ) -> Result<(), MapError> {
        let root = self.table(self.root);
        if (pml4_index(USER_SIZE)..crate::table::ENTRIES).any(|i| root.get(i).present()) {
            return Err(MapError::AlreadyExists);
        }

        let phys = layout.physical_memory;
        let Some(phys_last) = phys.last() else {
            return Err(MapError::InvalidArgument("no physical memory to map"));
        };
        if phys_last.as_u64() >= DIRECT_MAP_SIZE {
            return Err(MapError::InvalidArgument("physical memory exceeds the direct map"));
        }
        if layout.kernel_image.is_some_and(|image| image.len() > KERNEL_IMAGE_SIZE) {
            return Err(MapError::InvalidArgument("kernel image exceeds its window"));
        }

        let link = PageEntry::table_link(false);
        let direct_slots = pml4_index(DIRECT_MAP_BASE + phys.base().as_u64())
            ..=pml4_index(DIRECT_MAP_BASE + phys_last.as_u64());
        let fixed_slots = [KERNEL_HEAP_WINDOW, KERNEL_IMAGE_WINDOW, KERNEL_MODULES_WINDOW]
            .into_iter()
            .flat_map(|w| w.first_pml4_index()..=w.last_pml4_index());
        for index in direct_slots.chain(fixed_slots) {
            self.ensure_child_table(alloc, self.root, PageLevel::Pml4, index, link)?;
        }

        let direct = VirtualRange::new(VirtualAddress::new(DIRECT_MAP_BASE + phys.base().as_u64()), phys.len());
        self.map_region(alloc, direct, phys, PageEntry::kernel_rw(), PageLevel::Pd)?;

        if let Some(image) = layout.kernel_image {
            let virt = VirtualRange::new(VirtualAddress::new(KERNEL_BASE), image.len());
            self.map(alloc, virt, image, PageEntry::kernel_rwx())?;
        }

        info!(
            "kernel windows seeded: direct map {:#x} bytes, image {:?}",
            phys.len(),
            layout.kernel_image
        );
        Ok(())
    }
}

#[inline]
const fn is_user(va: VirtualAddress) -> bool {
    va.as_u64() < USER_SIZE
}

fn check_pair(virt: VirtualRange, phys: PhysicalRange) -> Result<(), MapError> {
    if virt.len() != phys.len() {
        return Err(MapError::InvalidArgument("virtual and physical sizes differ"));
    }
    if virt.is_empty() {
        return Err(MapError::InvalidArgument("empty range"));
    }
    if !virt.is_page_aligned() || !phys.is_page_aligned() {
        return Err(MapError::InvalidArgument("range not page aligned"));
    }
    let canonical = virt.last().is_some_and(|last| last.is_canonical() && virt.base().is_canonical());
    if !canonical {
        return Err(MapError::InvalidArgument("non-canonical virtual range"));
    }
    Ok(())
}

/// Offset of the next address worth walking after `va`: the end of the leaf,
/// or of the region the missing entry would have covered.
fn next_offset(range: VirtualRange, offset: u64, va: VirtualAddress, walk: &Walk) -> u64 {
    let span = walk.level.span();
    let step = span - (va.as_u64() & (span - 1));
    offset.saturating_add(step).min(range.len())
}

#[cfg(test)]
mod tests;
