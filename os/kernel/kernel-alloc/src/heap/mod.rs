//! # Kernel Heap
//!
//! Two strategies implement [`HeapAllocator`] over a window of the kernel
//! heap:
//!
//! - [`BumpHeap`]: grows a single range and never reclaims. Used while
//!   nothing better exists.
//! - [`SlabHeap`]: size classes of page-sized slabs for small objects,
//!   whole frames through the direct map for large ones.
//!
//! Neither talks to the frame allocator or the page tables directly. Pages
//! arrive through a [`PageSource`], which [`KernelPageSource`] implements
//! for the kernel address space. [`KernelHeap`] exposes a heap as the
//! `GlobalAlloc` of the kernel.

mod bump;
mod global;
mod large;
mod size_class;
mod slab;
#[cfg(test)]
pub(crate) mod test_support;

pub use bump::BumpHeap;
pub use global::KernelHeap;
pub use size_class::{LARGE_THRESHOLD, SIZE_CLASSES, class_for};
pub use slab::{ClassStats, SlabHeap, SlabInfo, SlabState};

use crate::frame::{FrameAllocator, FrameRange, LockedFrameAlloc, TableFrames};
use crate::{AllocHints, MemoryError};
use kernel_memory_addresses::{PageSize, PhysicalRange, Size4K, VirtualAddress, VirtualRange};
use kernel_sync::SpinLock;
use kernel_vmem::{AddressSpace, PageEntry, PhysMapper};
use log::{trace, warn};

/// The capability every heap strategy provides.
pub trait HeapAllocator {
    /// Allocate `size` bytes with the strategy's natural alignment.
    ///
    /// # Errors
    /// As for [`alloc_aligned`](Self::alloc_aligned).
    fn alloc(&self, size: usize, hints: AllocHints) -> Result<VirtualRange, MemoryError> {
        self.alloc_aligned(size, 1, hints)
    }

    /// Allocate `size` bytes at an address aligned to `align`.
    ///
    /// # Errors
    /// - [`MemoryError::InvalidArgument`] for a zero size or an alignment
    ///   that is not a power of two or not supported.
    /// - [`MemoryError::OutOfMemory`] if no memory is left.
    fn alloc_aligned(&self, size: usize, align: usize, hints: AllocHints) -> Result<VirtualRange, MemoryError>;

    /// Give back the allocation starting at `address`.
    ///
    /// # Errors
    /// Strategy specific; see the implementations.
    fn free(&self, address: VirtualAddress) -> Result<(), MemoryError>;
}

/// Where heaps get their memory from.
///
/// # Safety
/// Memory returned by [`back`](Self::back) and
/// [`alloc_direct`](Self::alloc_direct) must be readable and writable at the
/// given addresses and used by nobody else until it is given back.
pub unsafe trait PageSource {
    /// Map fresh frames behind every page of `range`.
    ///
    /// # Errors
    /// [`MemoryError::OutOfMemory`], or [`MemoryError::AlreadyExists`] if a
    /// page is mapped already. Nothing stays mapped on failure.
    fn back(&self, range: VirtualRange) -> Result<(), MemoryError>;

    /// Unmap `range` and free the frames behind it.
    ///
    /// # Errors
    /// [`MemoryError::InvalidArgument`] for a misaligned range.
    fn unback(&self, range: VirtualRange) -> Result<(), MemoryError>;

    /// At least `len` bytes of zeroed, physically contiguous memory outside
    /// the heap windows. The returned range is page aligned.
    ///
    /// # Errors
    /// [`MemoryError::OutOfMemory`] or [`MemoryError::InvalidArgument`] for a
    /// zero length.
    fn alloc_direct(&self, len: u64) -> Result<VirtualRange, MemoryError>;

    /// Give back exactly a range returned by [`alloc_direct`](Self::alloc_direct).
    ///
    /// # Errors
    /// [`MemoryError::InvalidArgument`] for a range that did not come from
    /// `alloc_direct`.
    fn free_direct(&self, range: VirtualRange) -> Result<(), MemoryError>;
}

/// [`PageSource`] over the kernel address space and frame allocator.
///
/// Locks are taken in the order address space, then frame allocator.
pub struct KernelPageSource<'s, 'm, M: PhysMapper, A> {
    space: &'s SpinLock<AddressSpace<'m, M>>,
    frames: &'s LockedFrameAlloc<A>,
    mapper: &'m M,
}

impl<'s, 'm, M: PhysMapper, A: FrameAllocator> KernelPageSource<'s, 'm, M, A> {
    pub fn new(space: &'s SpinLock<AddressSpace<'m, M>>, frames: &'s LockedFrameAlloc<A>) -> Self {
        let mapper = space.lock().mapper();
        Self { space, frames, mapper }
    }

    fn free_frame(&self, pa: PhysicalRange) {
        // SAFETY: the frame was mapped by `back`, which owned it.
        let frame = unsafe { FrameRange::from_raw(pa) };
        if let Err(e) = self.frames.free(frame) {
            warn!("heap frame {} could not be freed: {e}", pa.base());
        }
    }
}

// SAFETY: `back` maps freshly allocated frames writable; `alloc_direct`
// hands out freshly allocated frames through the direct map.
unsafe impl<M: PhysMapper, A: FrameAllocator> PageSource for KernelPageSource<'_, '_, M, A> {
    fn back(&self, range: VirtualRange) -> Result<(), MemoryError> {
        if range.is_empty() || !range.is_page_aligned() {
            return Err(MemoryError::InvalidArgument("heap range empty or not page aligned"));
        }

        let mut space = self.space.lock();
        let mut tables = TableFrames(self.frames);
        let mut done = 0;
        while done < range.len() {
            let page = VirtualRange::new(range.base() + done, Size4K::SIZE);
            let result = self.frames.alloc(Size4K::SIZE, AllocHints::KERNEL).and_then(|frame| {
                let pa = frame.into_raw();
                space.map(&mut tables, page, pa, PageEntry::kernel_rw()).map_err(|e| {
                    self.free_frame(pa);
                    MemoryError::from(e)
                })
            });
            if let Err(e) = result {
                drop(space);
                if done > 0 {
                    self.unback(VirtualRange::new(range.base(), done))?;
                }
                return Err(e);
            }
            done += Size4K::SIZE;
        }
        trace!("heap backed {:?}", range);
        Ok(())
    }

    fn unback(&self, range: VirtualRange) -> Result<(), MemoryError> {
        if range.is_empty() || !range.is_page_aligned() {
            return Err(MemoryError::InvalidArgument("heap range empty or not page aligned"));
        }

        let mut space = self.space.lock();
        let mut tables = TableFrames(self.frames);
        let mut offset = 0;
        while offset < range.len() {
            let va = range.base() + offset;
            offset += Size4K::SIZE;
            let Ok(translation) = space.translate(va) else {
                continue;
            };
            space.unmap(&mut tables, VirtualRange::new(va, Size4K::SIZE))?;
            self.free_frame(PhysicalRange::new(translation.physical, Size4K::SIZE));
        }
        trace!("heap unbacked {:?}", range);
        Ok(())
    }

    fn alloc_direct(&self, len: u64) -> Result<VirtualRange, MemoryError> {
        let pa = self.frames.alloc(len, AllocHints::KERNEL)?.into_raw();
        let va = self.mapper.phys_to_virt(pa.base());
        #[allow(clippy::cast_possible_truncation)]
        let len = pa.len() as usize;
        // SAFETY: the frames were just allocated and are visible through the mapper.
        unsafe { core::ptr::write_bytes(va.as_mut_ptr::<u8>(), 0, len) };
        Ok(VirtualRange::new(va, pa.len()))
    }

    fn free_direct(&self, range: VirtualRange) -> Result<(), MemoryError> {
        let Some(pa) = self.mapper.virt_to_phys(range.base()) else {
            return Err(MemoryError::InvalidArgument("address outside the direct map"));
        };
        // SAFETY: `alloc_direct` gave away the handle for exactly this range.
        let frames = unsafe { FrameRange::from_raw(PhysicalRange::new(pa, range.len())) };
        self.frames.free(frames)
    }
}

/// `size` and `align` checked as the heaps expect them. No heap aligns
/// beyond a page.
fn check_request(size: usize, align: usize) -> Result<(u64, u64), MemoryError> {
    if size == 0 {
        return Err(MemoryError::InvalidArgument("zero-sized heap allocation"));
    }
    if !align.is_power_of_two() {
        return Err(MemoryError::InvalidArgument("alignment not a power of two"));
    }
    if align as u64 > Size4K::SIZE {
        return Err(MemoryError::InvalidArgument("alignment larger than a page"));
    }
    Ok((size as u64, align as u64))
}
