use super::{FrameAllocator, FrameRange, frame_count, frame_span, frames_for};
use crate::{AllocHints, MemoryError};
use kernel_bitrange::{BitRange, BitRangeAlloc, ScanDirection};
use kernel_memory_addresses::{PageSize, PhysicalRange, Size4K};
use log::{trace, warn};

/// One bit per 4 KiB frame of the usable span; a set bit is a used frame.
pub struct BitmapFrameAlloc<'a> {
    usable: PhysicalRange,
    frames: BitRangeAlloc<'a>,
}

impl<'a> BitmapFrameAlloc<'a> {
    /// Words of bitmap storage needed for `usable`.
    #[must_use]
    pub const fn storage_words(usable: PhysicalRange) -> usize {
        BitRangeAlloc::words_for(frame_count(usable))
    }

    /// Manage `usable` with every frame free.
    ///
    /// # Errors
    /// [`MemoryError::InvalidArgument`] if `usable` is empty or not page
    /// aligned, or `storage` is too small.
    pub fn new(usable: PhysicalRange, storage: &'a mut [u64]) -> Result<Self, MemoryError> {
        if usable.is_empty() || !usable.is_page_aligned() {
            return Err(MemoryError::InvalidArgument("usable span empty or not page aligned"));
        }
        if storage.len() < Self::storage_words(usable) {
            return Err(MemoryError::InvalidArgument("frame bitmap storage too small"));
        }

        Ok(Self {
            usable,
            frames: BitRangeAlloc::new(storage, frame_count(usable)),
        })
    }

    fn bits_of(&self, range: PhysicalRange) -> Result<BitRange, MemoryError> {
        let (first, count) = frame_span(self.usable, range)?;
        Ok(BitRange::new(first, count))
    }

    fn range_of(&self, bits: BitRange) -> PhysicalRange {
        PhysicalRange::new(
            self.usable.base() + bits.start as u64 * Size4K::SIZE,
            bits.len as u64 * Size4K::SIZE,
        )
    }
}

impl FrameAllocator for BitmapFrameAlloc<'_> {
    fn alloc(&mut self, size: u64, hints: AllocHints) -> Result<FrameRange, MemoryError> {
        let count = frames_for(size)?;
        let (start, direction) = if hints.kernel() {
            (self.frames.len() - 1, ScanDirection::Descending)
        } else {
            (0, ScanDirection::Ascending)
        };

        let Some(bits) = self.frames.alloc(count, start, direction) else {
            warn!("no run of {count} free frames ({} free in total)", self.frames.available());
            return Err(MemoryError::OutOfMemory);
        };

        let range = self.range_of(bits);
        trace!("frames {} +{:#x} allocated", range.base(), range.len());
        Ok(FrameRange::new(range))
    }

    fn free(&mut self, frames: FrameRange) -> Result<(), MemoryError> {
        let range = frames.into_raw();
        let bits = self.bits_of(range)?;
        if !self.frames.all(bits, true) {
            return Err(MemoryError::InvalidArgument("double free of frames"));
        }
        self.frames.free(bits);
        trace!("frames {} +{:#x} freed", range.base(), range.len());
        Ok(())
    }

    fn take(&mut self, range: PhysicalRange) -> Result<FrameRange, MemoryError> {
        let bits = self.bits_of(range)?;
        if !self.frames.all(bits, false) {
            return Err(MemoryError::AlreadyExists);
        }
        self.frames.set_range(bits, true);
        Ok(FrameRange::new(range))
    }

    fn mark(&mut self, range: PhysicalRange, used: bool) -> Result<(), MemoryError> {
        let bits = self.bits_of(range)?;
        self.frames.set_range(bits, used);
        Ok(())
    }

    fn usable(&self) -> PhysicalRange {
        self.usable
    }

    fn used_frames(&self) -> usize {
        self.frames.used()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::PhysicalAddress;

    const BASE: u64 = 0x10_0000;

    fn span(frames: u64) -> PhysicalRange {
        PhysicalRange::new(PhysicalAddress::new(BASE), frames * 4096)
    }

    fn range(frame: u64, frames: u64) -> PhysicalRange {
        PhysicalRange::new(PhysicalAddress::new(BASE + frame * 4096), frames * 4096)
    }

    #[test]
    fn sizes_round_up_to_frames() {
        let mut storage = vec![0u64; BitmapFrameAlloc::storage_words(span(16))];
        let mut frames = BitmapFrameAlloc::new(span(16), &mut storage).unwrap();

        let a = frames.alloc(1, AllocHints::new()).unwrap();
        assert_eq!(a.range(), range(0, 1));
        let b = frames.alloc(4097, AllocHints::new()).unwrap();
        assert_eq!(b.range(), range(1, 2));
        assert_eq!(frames.used_frames(), 3);

        frames.free(a).unwrap();
        frames.free(b).unwrap();
        assert_eq!(frames.used_frames(), 0);
    }

    #[test]
    fn kernel_hint_places_near_the_top() {
        let mut storage = vec![0u64; BitmapFrameAlloc::storage_words(span(16))];
        let mut frames = BitmapFrameAlloc::new(span(16), &mut storage).unwrap();

        let k = frames.alloc(3 * 4096, AllocHints::KERNEL).unwrap();
        assert_eq!(k.range(), range(13, 3));
        let u = frames.alloc(4096, AllocHints::new()).unwrap();
        assert_eq!(u.range(), range(0, 1));

        frames.free(k).unwrap();
        frames.free(u).unwrap();
    }

    #[test]
    fn exhaustion_leaves_state_unchanged() {
        let mut storage = vec![0u64; BitmapFrameAlloc::storage_words(span(8))];
        let mut frames = BitmapFrameAlloc::new(span(8), &mut storage).unwrap();
        let hole = frames.take(range(4, 1)).unwrap();

        assert_eq!(frames.alloc(5 * 4096, AllocHints::new()), Err(MemoryError::OutOfMemory));
        assert_eq!(frames.used_frames(), 1);
        frames.free(hole).unwrap();
        let all = frames.alloc(8 * 4096, AllocHints::new()).unwrap();
        frames.free(all).unwrap();
    }

    #[test]
    fn free_and_take_reject_bad_ranges_without_mutating() {
        let mut storage = vec![0u64; BitmapFrameAlloc::storage_words(span(8))];
        let mut frames = BitmapFrameAlloc::new(span(8), &mut storage).unwrap();
        let held = frames.alloc(4096, AllocHints::new()).unwrap();

        let outside = PhysicalRange::new(PhysicalAddress::new(BASE - 4096), 2 * 4096);
        let misaligned = PhysicalRange::new(PhysicalAddress::new(BASE + 10), 4096);
        for bad in [outside, misaligned] {
            assert!(matches!(frames.take(bad), Err(MemoryError::InvalidArgument(_))));
            let handle = unsafe { FrameRange::from_raw(bad) };
            assert!(matches!(frames.free(handle), Err(MemoryError::InvalidArgument(_))));
        }
        assert_eq!(frames.used_frames(), 1);

        assert_eq!(frames.take(held.range()), Err(MemoryError::AlreadyExists));
        let copy = unsafe { FrameRange::from_raw(held.range()) };
        frames.free(held).unwrap();
        assert!(matches!(frames.free(copy), Err(MemoryError::InvalidArgument(_))));
        assert_eq!(frames.used_frames(), 0);
    }

    #[test]
    fn mark_forces_state() {
        let mut storage = vec![0u64; BitmapFrameAlloc::storage_words(span(8))];
        let mut frames = BitmapFrameAlloc::new(span(8), &mut storage).unwrap();
        frames.mark(range(0, 4), true).unwrap();
        frames.mark(range(2, 4), true).unwrap();
        assert_eq!(frames.used_frames(), 6);
        frames.mark(range(0, 8), false).unwrap();
        assert_eq!(frames.used_frames(), 0);
    }
}
