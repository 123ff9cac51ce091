//! # Physical Frame Allocation
//!
//! Usable physical memory is tracked as 4 KiB frames inside one contiguous
//! span picked at boot. Two strategies implement [`FrameAllocator`]:
//!
//! - [`BitmapFrameAlloc`]: one bit per frame, runs found by scanning.
//! - [`BuddyFrameAlloc`]: power-of-two blocks with splitting and coalescing.
//!
//! [`KernelFrameAlloc`] picks one of them once, and [`LockedFrameAlloc`]
//! serializes access for the rest of the kernel.

mod bitmap;
mod buddy;

pub use bitmap::BitmapFrameAlloc;
pub use buddy::BuddyFrameAlloc;

use crate::{AllocHints, MemoryError};
use core::mem::ManuallyDrop;
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, PhysicalRange, Size4K};
use kernel_sync::{SpinLock, SpinLockGuard};
use kernel_vmem::FrameAlloc;
use log::warn;

/// Frames handed out by a [`FrameAllocator`].
///
/// Move-only: the frames go back exactly once through
/// [`FrameAllocator::free`]. Dropping the handle instead leaks the frames
/// and logs a warning; [`into_raw`](Self::into_raw) hands ownership to
/// something that does not hold the handle, such as a page-table leaf.
#[must_use = "dropping a frame range leaks its frames"]
#[derive(PartialEq, Eq)]
pub struct FrameRange {
    range: PhysicalRange,
}

impl FrameRange {
    #[inline]
    pub(crate) const fn new(range: PhysicalRange) -> Self {
        Self { range }
    }

    /// Re-adopt frames given away with [`into_raw`](Self::into_raw).
    ///
    /// # Safety
    /// `range` must have come from `into_raw` of a handle of the same
    /// allocator, and no other handle may exist for it.
    #[inline]
    pub const unsafe fn from_raw(range: PhysicalRange) -> Self {
        Self { range }
    }

    #[inline]
    #[must_use]
    pub const fn range(&self) -> PhysicalRange {
        self.range
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.range.base()
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.range.len()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Give up the handle without freeing the frames.
    #[inline]
    #[must_use]
    pub fn into_raw(self) -> PhysicalRange {
        ManuallyDrop::new(self).range
    }
}

impl core::fmt::Debug for FrameRange {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "FrameRange({}, {:#x})", self.range.base(), self.range.len())
    }
}

impl Drop for FrameRange {
    fn drop(&mut self) {
        warn!("leaked {:#x} bytes of frames at {}", self.range.len(), self.range.base());
    }
}

/// The capability every frame allocation strategy provides.
pub trait FrameAllocator {
    /// Allocate at least `size` bytes of contiguous frames.
    ///
    /// # Errors
    /// - [`MemoryError::InvalidArgument`] for a zero size.
    /// - [`MemoryError::OutOfMemory`] if no suitable run is free.
    fn alloc(&mut self, size: u64, hints: AllocHints) -> Result<FrameRange, MemoryError>;

    /// Return frames obtained from [`alloc`](Self::alloc) or [`take`](Self::take).
    ///
    /// # Errors
    /// [`MemoryError::InvalidArgument`] if the range is misaligned, outside
    /// the usable span, or (partly) free already. State is unchanged then.
    fn free(&mut self, frames: FrameRange) -> Result<(), MemoryError>;

    /// Claim exactly `range` without searching.
    ///
    /// # Errors
    /// - [`MemoryError::InvalidArgument`] as for [`free`](Self::free).
    /// - [`MemoryError::AlreadyExists`] if any frame of it is in use.
    fn take(&mut self, range: PhysicalRange) -> Result<FrameRange, MemoryError>;

    /// Force every frame of `range` to used or free, whatever its state.
    ///
    /// # Errors
    /// [`MemoryError::InvalidArgument`] if the range is misaligned or outside
    /// the usable span.
    fn mark(&mut self, range: PhysicalRange, used: bool) -> Result<(), MemoryError>;

    /// The span this allocator manages.
    fn usable(&self) -> PhysicalRange;

    /// Number of frames currently in use.
    fn used_frames(&self) -> usize;
}

/// Which strategy backs the kernel's frame allocator.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum FrameStrategy {
    #[default]
    Bitmap,
    Buddy,
}

/// The frame allocator selected at boot.
pub enum KernelFrameAlloc<'a> {
    Bitmap(BitmapFrameAlloc<'a>),
    Buddy(BuddyFrameAlloc<'a>),
}

impl<'a> KernelFrameAlloc<'a> {
    /// Words of storage the chosen strategy needs for `usable`.
    #[must_use]
    pub fn storage_words(strategy: FrameStrategy, usable: PhysicalRange) -> usize {
        match strategy {
            FrameStrategy::Bitmap => BitmapFrameAlloc::storage_words(usable),
            FrameStrategy::Buddy => BuddyFrameAlloc::storage_words(usable),
        }
    }

    /// Build the chosen strategy over `usable` with every frame free.
    ///
    /// # Errors
    /// [`MemoryError::InvalidArgument`] for an empty or misaligned span or
    /// too little storage.
    pub fn new(strategy: FrameStrategy, usable: PhysicalRange, storage: &'a mut [u64]) -> Result<Self, MemoryError> {
        Ok(match strategy {
            FrameStrategy::Bitmap => Self::Bitmap(BitmapFrameAlloc::new(usable, storage)?),
            FrameStrategy::Buddy => Self::Buddy(BuddyFrameAlloc::new(usable, storage)?),
        })
    }

    #[must_use]
    pub const fn strategy(&self) -> FrameStrategy {
        match self {
            Self::Bitmap(_) => FrameStrategy::Bitmap,
            Self::Buddy(_) => FrameStrategy::Buddy,
        }
    }
}

impl FrameAllocator for KernelFrameAlloc<'_> {
    fn alloc(&mut self, size: u64, hints: AllocHints) -> Result<FrameRange, MemoryError> {
        match self {
            Self::Bitmap(a) => a.alloc(size, hints),
            Self::Buddy(a) => a.alloc(size, hints),
        }
    }

    fn free(&mut self, frames: FrameRange) -> Result<(), MemoryError> {
        match self {
            Self::Bitmap(a) => a.free(frames),
            Self::Buddy(a) => a.free(frames),
        }
    }

    fn take(&mut self, range: PhysicalRange) -> Result<FrameRange, MemoryError> {
        match self {
            Self::Bitmap(a) => a.take(range),
            Self::Buddy(a) => a.take(range),
        }
    }

    fn mark(&mut self, range: PhysicalRange, used: bool) -> Result<(), MemoryError> {
        match self {
            Self::Bitmap(a) => a.mark(range, used),
            Self::Buddy(a) => a.mark(range, used),
        }
    }

    fn usable(&self) -> PhysicalRange {
        match self {
            Self::Bitmap(a) => a.usable(),
            Self::Buddy(a) => a.usable(),
        }
    }

    fn used_frames(&self) -> usize {
        match self {
            Self::Bitmap(a) => a.used_frames(),
            Self::Buddy(a) => a.used_frames(),
        }
    }
}

/// A [`FrameAllocator`] behind one spin lock.
pub struct LockedFrameAlloc<A> {
    inner: SpinLock<A>,
}

impl<A: FrameAllocator> LockedFrameAlloc<A> {
    #[must_use]
    pub const fn new(inner: A) -> Self {
        Self {
            inner: SpinLock::new(inner),
        }
    }

    /// Lock with interrupts withheld for atomic-context requests.
    fn lock(&self, hints: AllocHints) -> SpinLockGuard<'_, A> {
        if hints.atomic() {
            self.inner.lock_irq()
        } else {
            self.inner.lock()
        }
    }

    /// See [`FrameAllocator::alloc`].
    ///
    /// # Errors
    /// As for [`FrameAllocator::alloc`].
    pub fn alloc(&self, size: u64, hints: AllocHints) -> Result<FrameRange, MemoryError> {
        self.lock(hints).alloc(size, hints)
    }

    /// See [`FrameAllocator::free`].
    ///
    /// # Errors
    /// As for [`FrameAllocator::free`].
    pub fn free(&self, frames: FrameRange) -> Result<(), MemoryError> {
        self.inner.lock().free(frames)
    }

    /// See [`FrameAllocator::take`].
    ///
    /// # Errors
    /// As for [`FrameAllocator::take`].
    pub fn take(&self, range: PhysicalRange) -> Result<FrameRange, MemoryError> {
        self.inner.lock().take(range)
    }

    /// See [`FrameAllocator::mark`].
    ///
    /// # Errors
    /// As for [`FrameAllocator::mark`].
    pub fn mark(&self, range: PhysicalRange, used: bool) -> Result<(), MemoryError> {
        self.inner.lock().mark(range, used)
    }

    #[must_use]
    pub fn usable(&self) -> PhysicalRange {
        self.inner.lock().usable()
    }

    #[must_use]
    pub fn used_frames(&self) -> usize {
        self.inner.lock().used_frames()
    }
}

/// Page-table frames for an address space, drawn from a [`LockedFrameAlloc`].
///
/// Frames handed to the mapper leave handle ownership; the mapper gives them
/// back through [`FrameAlloc::free_4k`] when a table is reclaimed.
pub struct TableFrames<'a, A>(pub &'a LockedFrameAlloc<A>);

impl<A: FrameAllocator> FrameAlloc for TableFrames<'_, A> {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        let frames = self.0.alloc(Size4K::SIZE, AllocHints::KERNEL).ok()?;
        Some(PhysicalPage::containing(frames.into_raw().base()))
    }

    fn free_4k(&mut self, page: PhysicalPage<Size4K>) {
        // SAFETY: the mapper only returns tables it got from `alloc_4k`.
        let frames = unsafe { FrameRange::from_raw(PhysicalRange::new(page.base(), Size4K::SIZE)) };
        if let Err(e) = self.0.free(frames) {
            warn!("page table {} could not be freed: {e}", page.base());
        }
    }
}

/// Frame count of a page-aligned span.
#[allow(clippy::cast_possible_truncation)]
const fn frame_count(span: PhysicalRange) -> usize {
    (span.len() / Size4K::SIZE) as usize
}

/// Frame indices `(first, count)` of `range` within `usable`.
fn frame_span(usable: PhysicalRange, range: PhysicalRange) -> Result<(usize, usize), MemoryError> {
    if range.is_empty() || !range.is_page_aligned() {
        return Err(MemoryError::InvalidArgument("frame range empty or not page aligned"));
    }
    if !usable.contains_range(range) {
        return Err(MemoryError::InvalidArgument("frame range outside usable memory"));
    }
    #[allow(clippy::cast_possible_truncation)]
    let first = ((range.base() - usable.base()) / Size4K::SIZE) as usize;
    Ok((first, frame_count(range)))
}

/// Frames needed for `size` bytes, or an error for zero or absurd sizes.
fn frames_for(size: u64) -> Result<usize, MemoryError> {
    if size == 0 {
        return Err(MemoryError::InvalidArgument("zero-sized frame allocation"));
    }
    usize::try_from(size.div_ceil(Size4K::SIZE)).map_err(|_| MemoryError::OutOfMemory)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span() -> PhysicalRange {
        PhysicalRange::new(PhysicalAddress::new(0x10_0000), 64 * 4096)
    }

    #[test]
    fn frame_span_validates_alignment_and_containment() {
        let usable = span();
        assert_eq!(
            frame_span(usable, PhysicalRange::new(PhysicalAddress::new(0x10_2000), 0x3000)),
            Ok((2, 3))
        );
        for bad in [
            PhysicalRange::new(PhysicalAddress::new(0x10_0800), 0x1000),
            PhysicalRange::new(PhysicalAddress::new(0x10_0000), 0x800),
            PhysicalRange::new(PhysicalAddress::new(0x0F_F000), 0x2000),
            PhysicalRange::new(PhysicalAddress::new(0x13_F000), 0x2000),
            PhysicalRange::new(PhysicalAddress::new(0x10_0000), 0),
        ] {
            assert!(matches!(frame_span(usable, bad), Err(MemoryError::InvalidArgument(_))));
        }
    }

    #[test]
    fn both_strategies_behave_alike_through_the_enum() {
        for strategy in [FrameStrategy::Bitmap, FrameStrategy::Buddy] {
            let mut storage = vec![0u64; KernelFrameAlloc::storage_words(strategy, span())];
            let mut frames = KernelFrameAlloc::new(strategy, span(), &mut storage).unwrap();
            assert_eq!(frames.strategy(), strategy);

            let a = frames.alloc(4096, AllocHints::new()).unwrap();
            let b = frames.alloc(4096, AllocHints::KERNEL).unwrap();
            assert!(!a.range().overlaps(b.range()));
            assert_eq!(a.base(), span().base());
            assert_eq!(frames.used_frames(), 2);

            frames.free(a).unwrap();
            frames.free(b).unwrap();
            assert_eq!(frames.used_frames(), 0);
            assert_eq!(frames.alloc(0, AllocHints::new()), Err(MemoryError::InvalidArgument("zero-sized frame allocation")));
        }
    }

    #[test]
    fn locked_allocator_feeds_page_tables() {
        let mut storage = vec![0u64; BitmapFrameAlloc::storage_words(span())];
        let locked = LockedFrameAlloc::new(BitmapFrameAlloc::new(span(), &mut storage).unwrap());
        let mut tables = TableFrames(&locked);

        let page = tables.alloc_4k().unwrap();
        assert_eq!(page.base(), PhysicalAddress::new(0x10_0000 + 63 * 4096));
        assert_eq!(locked.used_frames(), 1);
        tables.free_4k(page);
        assert_eq!(locked.used_frames(), 0);

        let atomic = locked.alloc(8192, AllocHints::KERNEL.with_atomic(true)).unwrap();
        assert_eq!(atomic.len(), 8192);
        locked.free(atomic).unwrap();
    }

    #[test]
    fn into_raw_and_from_raw_move_ownership() {
        let mut storage = vec![0u64; BitmapFrameAlloc::storage_words(span())];
        let mut frames = BitmapFrameAlloc::new(span(), &mut storage).unwrap();
        let range = frames.alloc(4096, AllocHints::new()).unwrap().into_raw();
        assert_eq!(frames.used_frames(), 1);
        frames.free(unsafe { FrameRange::from_raw(range) }).unwrap();
        assert_eq!(frames.used_frames(), 0);
    }
}
