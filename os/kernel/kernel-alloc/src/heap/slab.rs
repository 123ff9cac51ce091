//! # Slab Heap
//!
//! Small objects live in slabs: single pages of the slab window, each cut
//! into equal objects of one size class. Everything about a slab is kept
//! outside the page, in a descriptor array indexed by the page's position in
//! the window:
//!
//! ```text
//!  window page:  0        1        2        3   ...
//!               ┌────────┬────────┬────────┬────────┐
//!  memory       │ 64 B × │ 24 B × │ unused │ 64 B × │
//!               │   64   │  170   │        │   64   │
//!               └────────┴────────┴────────┴────────┘
//!  descriptors  [Slab 0] [Slab 1] [Slab 2] [Slab 3]   free bitmap, counts,
//!                                                     class, list links
//! ```
//!
//! Freeing an address therefore needs no header in front of the object: the
//! page number selects the descriptor, the offset selects the bit.
//!
//! Each size class owns one active slab per CPU plus a shared one, and lists
//! of full, partial and empty slabs. At most one empty slab is kept per
//! class; further ones are unmapped.
//!
//! Requests of half a page or more skip the slabs and get whole frames from
//! [`PageSource::alloc_direct`].
//!
//! ## Locking
//! A size class lock is always taken before the arena lock, which guards the
//! descriptors and the page bitmap. Backing or unbacking pages happens under
//! both and reaches the address space and frame allocator after them.

use super::large::LargeTable;
use super::size_class::{SIZE_CLASSES, class_for};
use super::{HeapAllocator, PageSource};
use crate::{AllocHints, MemoryError};
use kernel_bitrange::{BitRangeAlloc, ScanDirection};
use kernel_info::memory::{MAX_CPUS, PAGE_SIZE};
use kernel_memory_addresses::{VirtualAddress, VirtualRange};
use kernel_sync::{SpinLock, SpinLockGuard};
use log::{trace, warn};

const CLASSES: usize = SIZE_CLASSES.len();

/// Bitmap words per slab: 512 objects of the smallest class.
const OBJECT_WORDS: usize = 8;

/// End of a slab list.
const NIL: u32 = u32::MAX;

/// Active-slab slot used when the CPU is unknown or out of range.
const SHARED_SLOT: usize = MAX_CPUS;

/// Where a slab currently is.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SlabState {
    /// No page behind this descriptor.
    Unused = 0,
    /// In a CPU's active slot.
    Active,
    Full,
    Partial,
    Empty,
}

/// Out-of-page slab descriptor. All zeroes is a valid [`SlabState::Unused`]
/// descriptor.
#[repr(C)]
struct Slab {
    /// Set bits are objects in use.
    used: [u64; OBJECT_WORDS],
    in_use: u16,
    objects: u16,
    class: u8,
    state: SlabState,
    /// Reserved for handing a slab between CPUs; never set yet.
    transfer_pending: bool,
    next: u32,
    prev: u32,
}

impl Slab {
    #[allow(clippy::cast_possible_truncation)]
    fn init(&mut self, class: usize) {
        self.used = [0; OBJECT_WORDS];
        self.in_use = 0;
        self.objects = (PAGE_SIZE as usize / SIZE_CLASSES[class]) as u16;
        self.class = class as u8;
        self.state = SlabState::Unused;
        self.transfer_pending = false;
        self.next = NIL;
        self.prev = NIL;
    }

    fn objects_map(&mut self) -> BitRangeAlloc<'_> {
        BitRangeAlloc::attach(&mut self.used, usize::from(self.objects))
    }

    fn take(&mut self) -> Option<usize> {
        let bits = self.objects_map().alloc(1, 0, ScanDirection::Ascending)?;
        self.in_use += 1;
        Some(bits.start)
    }

    const fn is_full(&self) -> bool {
        self.in_use == self.objects
    }
}

#[derive(Copy, Clone)]
struct SlabList {
    head: u32,
    len: usize,
}

impl SlabList {
    const fn new() -> Self {
        Self { head: NIL, len: 0 }
    }
}

struct ClassLists {
    full: SlabList,
    partial: SlabList,
    empty: SlabList,
    active: [Option<u32>; MAX_CPUS + 1],
}

impl ClassLists {
    const fn new() -> Self {
        Self {
            full: SlabList::new(),
            partial: SlabList::new(),
            empty: SlabList::new(),
            active: [None; MAX_CPUS + 1],
        }
    }
}

/// Descriptors and page bitmap. Both live in memory from
/// [`PageSource::alloc_direct`] that the heap owns until it is dropped.
struct SlabArena {
    /// One bit per page of the slab window; set while a slab owns it.
    pages: BitRangeAlloc<'static>,
    slabs: &'static mut [Slab],
}

impl SlabArena {
    fn slab(&mut self, index: u32) -> &mut Slab {
        &mut self.slabs[index as usize]
    }

    fn push(&mut self, list: &mut SlabList, index: u32) {
        let head = list.head;
        let slab = self.slab(index);
        slab.prev = NIL;
        slab.next = head;
        if head != NIL {
            self.slab(head).prev = index;
        }
        list.head = index;
        list.len += 1;
    }

    fn unlink(&mut self, list: &mut SlabList, index: u32) {
        let slab = self.slab(index);
        let (prev, next) = (slab.prev, slab.next);
        if prev == NIL {
            list.head = next;
        } else {
            self.slab(prev).next = next;
        }
        if next != NIL {
            self.slab(next).prev = prev;
        }
        list.len -= 1;
    }

    fn pop(&mut self, list: &mut SlabList) -> Option<u32> {
        let head = list.head;
        if head == NIL {
            return None;
        }
        self.unlink(list, head);
        Some(head)
    }
}

/// A snapshot of one slab, for diagnostics.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SlabInfo {
    pub class_size: usize,
    pub objects: usize,
    pub in_use: usize,
    pub state: SlabState,
    pub transfer_pending: bool,
}

/// Slab counts of one size class.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ClassStats {
    pub active: usize,
    pub partial: usize,
    pub full: usize,
    pub empty: usize,
}

/// General-purpose kernel heap of size-class slabs.
pub struct SlabHeap<P: PageSource> {
    source: P,
    window: VirtualRange,
    metadata: VirtualRange,
    arena: SpinLock<SlabArena>,
    classes: [SpinLock<ClassLists>; CLASSES],
    large: SpinLock<LargeTable>,
    cpu_id: fn() -> Option<usize>,
}

fn acquire<T>(lock: &SpinLock<T>, hints: AllocHints) -> SpinLockGuard<'_, T> {
    if hints.atomic() {
        lock.lock_irq()
    } else {
        lock.lock()
    }
}

impl<P: PageSource> SlabHeap<P> {
    /// A heap whose slabs come from the pages of `window`.
    ///
    /// Descriptors for every page of the window are allocated up front.
    ///
    /// # Errors
    /// - [`MemoryError::InvalidArgument`] for an empty, misaligned or
    ///   oversized window.
    /// - Whatever [`PageSource::alloc_direct`] reports for the descriptors.
    pub fn new(source: P, window: VirtualRange) -> Result<Self, MemoryError> {
        if window.is_empty() || !window.is_page_aligned() {
            return Err(MemoryError::InvalidArgument("slab window empty or not page aligned"));
        }
        let pages = usize::try_from(window.pages())
            .ok()
            .filter(|&p| p < NIL as usize)
            .ok_or(MemoryError::InvalidArgument("slab window too large"))?;

        let words = BitRangeAlloc::words_for(pages);
        let bytes = words * size_of::<u64>() + pages * size_of::<Slab>();
        let metadata = source.alloc_direct(bytes as u64)?;

        let base = metadata.base().as_mut_ptr::<u64>();
        // SAFETY: `alloc_direct` returned at least `bytes` zeroed bytes that
        // stay ours until `drop`. Both slices are 8-byte aligned and disjoint,
        // and all zeroes is a valid `Slab`.
        let (page_words, slabs) = unsafe {
            (
                core::slice::from_raw_parts_mut(base, words),
                core::slice::from_raw_parts_mut(base.add(words).cast::<Slab>(), pages),
            )
        };

        trace!("slab heap over {window:?}, {pages} descriptors");
        Ok(Self {
            source,
            window,
            metadata,
            arena: SpinLock::new(SlabArena {
                pages: BitRangeAlloc::new(page_words, pages),
                slabs,
            }),
            classes: [const { SpinLock::new(ClassLists::new()) }; CLASSES],
            large: SpinLock::new(LargeTable::new()),
            cpu_id: || None,
        })
    }

    /// Pick active slabs per CPU, as reported by `cpu_id`.
    #[must_use]
    pub fn with_cpu_id(mut self, cpu_id: fn() -> Option<usize>) -> Self {
        self.cpu_id = cpu_id;
        self
    }

    #[must_use]
    pub const fn window(&self) -> VirtualRange {
        self.window
    }

    fn slot(&self) -> usize {
        (self.cpu_id)().filter(|&cpu| cpu < MAX_CPUS).unwrap_or(SHARED_SLOT)
    }

    fn page_of(&self, index: u32) -> VirtualRange {
        VirtualRange::new(self.window.base() + u64::from(index) * PAGE_SIZE, PAGE_SIZE)
    }

    fn alloc_small(&self, class: usize, hints: AllocHints) -> Result<VirtualRange, MemoryError> {
        let mut lists = acquire(&self.classes[class], hints);
        let mut arena = acquire(&self.arena, hints);
        let slot = self.slot();

        let index = if let Some(index) = lists.active[slot] {
            index
        } else {
            let reused = match arena.pop(&mut lists.partial) {
                Some(index) => Some(index),
                None => arena.pop(&mut lists.empty),
            };
            let index = match reused {
                Some(index) => index,
                None => self.create_slab(&mut arena, class)?,
            };
            arena.slab(index).state = SlabState::Active;
            lists.active[slot] = Some(index);
            index
        };

        let slab = arena.slab(index);
        let Some(object) = slab.take() else {
            unreachable!("active slab {index} has no free object");
        };
        if slab.is_full() {
            slab.state = SlabState::Full;
            lists.active[slot] = None;
            arena.push(&mut lists.full, index);
        }

        let size = SIZE_CLASSES[class];
        let address = self.page_of(index).base() + (object * size) as u64;
        Ok(VirtualRange::new(address, size as u64))
    }

    fn create_slab(&self, arena: &mut SlabArena, class: usize) -> Result<u32, MemoryError> {
        let Some(bits) = arena.pages.alloc(1, 0, ScanDirection::Ascending) else {
            warn!("slab window {:?} has no free page", self.window);
            return Err(MemoryError::OutOfMemory);
        };
        #[allow(clippy::cast_possible_truncation)]
        let index = bits.start as u32;
        if let Err(e) = self.source.back(self.page_of(index)) {
            arena.pages.free(bits);
            return Err(e);
        }
        arena.slab(index).init(class);
        trace!("slab {index} created for {}-byte objects", SIZE_CLASSES[class]);
        Ok(index)
    }

    /// Park an emptied slab, or unmap it if the class already has an empty one.
    fn retire(&self, lists: &mut ClassLists, arena: &mut SlabArena, index: u32) {
        if lists.empty.len == 0 {
            arena.slab(index).state = SlabState::Empty;
            arena.push(&mut lists.empty, index);
            return;
        }
        if let Err(e) = self.source.unback(self.page_of(index)) {
            warn!("slab {index} could not be unmapped: {e}");
            arena.slab(index).state = SlabState::Empty;
            arena.push(&mut lists.empty, index);
            return;
        }
        arena.slab(index).state = SlabState::Unused;
        arena.pages.set(index as usize, false);
        trace!("slab {index} destroyed");
    }

    fn free_small(&self, address: VirtualAddress, offset: u64) -> Result<(), MemoryError> {
        #[allow(clippy::cast_possible_truncation)]
        let index = (offset / PAGE_SIZE) as u32;
        let in_page = offset % PAGE_SIZE;

        let class = {
            let mut arena = self.arena.lock();
            let slab = arena.slab(index);
            if slab.state == SlabState::Unused {
                return Err(MemoryError::InvalidArgument("address not in a live slab"));
            }
            usize::from(slab.class)
        };

        let mut lists = self.classes[class].lock();
        let mut arena = self.arena.lock();
        let slab = arena.slab(index);
        if slab.state == SlabState::Unused || usize::from(slab.class) != class {
            return Err(MemoryError::InvalidArgument("address not in a live slab"));
        }

        let size = SIZE_CLASSES[class] as u64;
        if !in_page.is_multiple_of(size) {
            return Err(MemoryError::InvalidArgument("address not at an object boundary"));
        }
        #[allow(clippy::cast_possible_truncation)]
        let object = (in_page / size) as usize;
        if object >= usize::from(slab.objects) {
            return Err(MemoryError::InvalidArgument("address past the last object"));
        }

        let mut map = slab.objects_map();
        if !map.get(object) {
            return Err(MemoryError::InvalidArgument("double free of heap object"));
        }
        map.set(object, false);
        let Some(in_use) = slab.in_use.checked_sub(1) else {
            panic!("slab {index} in-use count underflow");
        };
        slab.in_use = in_use;
        let state = slab.state;
        trace!("object {address} freed to slab {index}");

        match state {
            SlabState::Full => {
                arena.unlink(&mut lists.full, index);
                if in_use == 0 {
                    self.retire(&mut lists, &mut arena, index);
                } else {
                    arena.slab(index).state = SlabState::Partial;
                    arena.push(&mut lists.partial, index);
                }
            }
            SlabState::Partial if in_use == 0 => {
                arena.unlink(&mut lists.partial, index);
                self.retire(&mut lists, &mut arena, index);
            }
            SlabState::Active | SlabState::Partial | SlabState::Empty | SlabState::Unused => {}
        }
        Ok(())
    }

    fn alloc_large(&self, size: u64, hints: AllocHints) -> Result<VirtualRange, MemoryError> {
        let range = self.source.alloc_direct(size)?;
        if let Err(e) = acquire(&self.large, hints).insert(range) {
            warn!("large allocation table full");
            self.source.free_direct(range)?;
            return Err(e);
        }
        trace!("large allocation {range:?}");
        Ok(range)
    }

    fn free_large(&self, address: VirtualAddress) -> Result<(), MemoryError> {
        let Some(range) = self.large.lock().remove(address) else {
            return Err(MemoryError::NotFound);
        };
        self.source.free_direct(range)
    }

    /// The slab holding `address`, if one is live.
    #[must_use]
    pub fn slab_info(&self, address: VirtualAddress) -> Option<SlabInfo> {
        let offset = self.window.offset_of(address)?;
        #[allow(clippy::cast_possible_truncation)]
        let index = (offset / PAGE_SIZE) as u32;
        let mut arena = self.arena.lock();
        let slab = arena.slab(index);
        (slab.state != SlabState::Unused).then(|| SlabInfo {
            class_size: SIZE_CLASSES[usize::from(slab.class)],
            objects: usize::from(slab.objects),
            in_use: usize::from(slab.in_use),
            state: slab.state,
            transfer_pending: slab.transfer_pending,
        })
    }

    /// Slab counts of size class `class`.
    ///
    /// # Panics
    /// If `class` is not an index into [`SIZE_CLASSES`].
    #[must_use]
    pub fn class_stats(&self, class: usize) -> ClassStats {
        let lists = self.classes[class].lock();
        ClassStats {
            active: lists.active.iter().flatten().count(),
            partial: lists.partial.len,
            full: lists.full.len,
            empty: lists.empty.len,
        }
    }

    /// Pages of the window currently owned by a slab.
    #[must_use]
    pub fn live_slabs(&self) -> usize {
        self.arena.lock().pages.used()
    }

    #[must_use]
    pub fn large_allocations(&self) -> usize {
        self.large.lock().len()
    }

    #[must_use]
    pub const fn source(&self) -> &P {
        &self.source
    }
}

impl<P: PageSource> HeapAllocator for SlabHeap<P> {
    fn alloc_aligned(&self, size: usize, align: usize, hints: AllocHints) -> Result<VirtualRange, MemoryError> {
        match class_for(size, align)? {
            Some(class) => self.alloc_small(class, hints),
            None => self.alloc_large(size as u64, hints),
        }
    }

    /// # Errors
    /// - [`MemoryError::InvalidArgument`] for an address inside the slab
    ///   window that is not a live object (misaligned, never allocated, or
    ///   freed already).
    /// - [`MemoryError::NotFound`] for an address outside the window that is
    ///   not a large allocation.
    fn free(&self, address: VirtualAddress) -> Result<(), MemoryError> {
        match self.window.offset_of(address) {
            Some(offset) => self.free_small(address, offset),
            None => self.free_large(address),
        }
    }
}

impl<P: PageSource> Drop for SlabHeap<P> {
    fn drop(&mut self) {
        let arena = self.arena.get_mut();
        for (index, slab) in arena.slabs.iter().enumerate() {
            if slab.state == SlabState::Unused {
                continue;
            }
            let page = VirtualRange::new(self.window.base() + index as u64 * PAGE_SIZE, PAGE_SIZE);
            if let Err(e) = self.source.unback(page) {
                warn!("slab page {page:?} could not be unmapped: {e}");
            }
        }
        for range in self.large.get_mut().drain() {
            if let Err(e) = self.source.free_direct(range) {
                warn!("large allocation {range:?} could not be freed: {e}");
            }
        }
        if let Err(e) = self.source.free_direct(self.metadata) {
            warn!("slab metadata could not be freed: {e}");
        }
    }
}
