//! Binary buddy allocator over the usable span.
//!
//! Order `k` describes blocks of `2^k` frames whose index `i` covers frames
//! `i << k .. (i + 1) << k`, counted from the start of the usable span. Each
//! order keeps a [`BitRangeAlloc`] in which a set bit marks a free block.
//! Free blocks never overlap and a free block's buddy is never free at the
//! same order (it would have been merged), except at [`MAX_ORDER`].

use super::{FrameAllocator, FrameRange, frame_count, frame_span, frames_for};
use crate::{AllocHints, MemoryError};
use kernel_bitrange::{BitRangeAlloc, ScanDirection};
use kernel_memory_addresses::{PageSize, PhysicalRange, Size4K};
use log::{trace, warn};

/// Largest block order: `2^10` frames, 4 MiB.
pub const MAX_ORDER: usize = 10;

const ORDERS: usize = MAX_ORDER + 1;

pub struct BuddyFrameAlloc<'a> {
    usable: PhysicalRange,
    frames: usize,
    free_frames: usize,
    orders: [BitRangeAlloc<'a>; ORDERS],
}

impl<'a> BuddyFrameAlloc<'a> {
    /// Words of storage for the free maps of every order.
    #[must_use]
    pub fn storage_words(usable: PhysicalRange) -> usize {
        let frames = frame_count(usable);
        (0..ORDERS).map(|k| BitRangeAlloc::words_for(frames >> k)).sum()
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
            return Err(MemoryError::InvalidArgument("buddy storage too small"));
        }

        let frames = frame_count(usable);
        let mut rest = storage;
        let orders = core::array::from_fn(|k| {
            let blocks = frames >> k;
            let (head, tail) = core::mem::take(&mut rest).split_at_mut(BitRangeAlloc::words_for(blocks));
            rest = tail;
            BitRangeAlloc::new(head, blocks)
        });

        let mut buddy = Self {
            usable,
            frames,
            free_frames: 0,
            orders,
        };
        buddy.release(0, frames);
        Ok(buddy)
    }

    /// Number of blocks that exist at `order`.
    #[inline]
    fn blocks(&self, order: usize) -> usize {
        self.orders[order].len()
    }

    /// The free block covering `frame`, as `(order, index)`.
    fn free_block_containing(&self, frame: usize) -> Option<(usize, usize)> {
        (0..ORDERS).find_map(|k| {
            let index = frame >> k;
            (index < self.blocks(k) && self.orders[k].get(index)).then_some((k, index))
        })
    }

    /// Put one block back, merging with its buddy while possible.
    fn free_block(&mut self, mut order: usize, mut index: usize) {
        self.free_frames += 1 << order;
        while order < MAX_ORDER {
            let buddy = index ^ 1;
            if buddy >= self.blocks(order) || !self.orders[order].get(buddy) {
                break;
            }
            self.orders[order].set(buddy, false);
            index >>= 1;
            order += 1;
        }
        self.orders[order].set(index, true);
    }

    /// Free frames `start..end`, split into the largest aligned blocks.
    fn release(&mut self, start: usize, end: usize) {
        let mut frame = start;
        while frame < end {
            let order = (0..=MAX_ORDER)
                .rev()
                .find(|&k| frame.is_multiple_of(1 << k) && frame + (1 << k) <= end)
                .unwrap_or(0);
            self.free_block(order, frame >> order);
            frame += 1 << order;
        }
    }

    /// Remove frames `start..end` from the free blocks covering them.
    /// Every frame in the range must be free.
    fn carve(&mut self, start: usize, end: usize) {
        let mut frame = start;
        while frame < end {
            let Some((order, index)) = self.free_block_containing(frame) else {
                unreachable!("frame {frame} is not free");
            };
            self.orders[order].set(index, false);
            self.free_frames -= 1 << order;

            let block_start = index << order;
            let block_end = block_start + (1 << order);
            if block_start < start {
                self.release(block_start, start);
            }
            if end < block_end {
                self.release(end, block_end);
            }
            frame = block_end;
        }
    }

    fn all_free(&self, start: usize, end: usize) -> bool {
        (start..end).all(|f| self.free_block_containing(f).is_some())
    }

    fn any_free(&self, start: usize, end: usize) -> bool {
        (start..end).any(|f| self.free_block_containing(f).is_some())
    }

    /// Blocks of `order` currently free; for tests and diagnostics.
    #[must_use]
    pub fn free_blocks(&self, order: usize) -> usize {
        self.orders.get(order).map_or(0, BitRangeAlloc::used)
    }

    fn range_of(&self, first: usize, frames: usize) -> PhysicalRange {
        PhysicalRange::new(
            self.usable.base() + first as u64 * Size4K::SIZE,
            frames as u64 * Size4K::SIZE,
        )
    }
}

impl FrameAllocator for BuddyFrameAlloc<'_> {
    fn alloc(&mut self, size: u64, hints: AllocHints) -> Result<FrameRange, MemoryError> {
        let count = frames_for(size)?;
        let order = count.next_power_of_two().trailing_zeros() as usize;
        if order > MAX_ORDER {
            warn!("{count} frames exceed the largest buddy block");
            return Err(MemoryError::OutOfMemory);
        }

        let (from, direction) = if hints.kernel() {
            (usize::MAX, ScanDirection::Descending)
        } else {
            (0, ScanDirection::Ascending)
        };
        let found = (order..ORDERS).find_map(|k| self.orders[k].find_set(from, direction).map(|i| (k, i)));
        let Some((mut k, mut index)) = found else {
            warn!("no free buddy block of order {order} ({} frames free)", self.free_frames);
            return Err(MemoryError::OutOfMemory);
        };

        self.orders[k].set(index, false);
        while k > order {
            k -= 1;
            let (keep, spare) = if hints.kernel() {
                (2 * index + 1, 2 * index)
            } else {
                (2 * index, 2 * index + 1)
            };
            self.orders[k].set(spare, true);
            index = keep;
        }
        self.free_frames -= 1 << order;

        let range = self.range_of(index << order, 1 << order);
        trace!("buddy order {order} block {} allocated", range.base());
        Ok(FrameRange::new(range))
    }

    fn free(&mut self, frames: FrameRange) -> Result<(), MemoryError> {
        let range = frames.into_raw();
        let (first, count) = frame_span(self.usable, range)?;
        if self.any_free(first, first + count) {
            return Err(MemoryError::InvalidArgument("double free of frames"));
        }
        self.release(first, first + count);
        trace!("frames {} +{:#x} freed", range.base(), range.len());
        Ok(())
    }

    fn take(&mut self, range: PhysicalRange) -> Result<FrameRange, MemoryError> {
        let (first, count) = frame_span(self.usable, range)?;
        if !self.all_free(first, first + count) {
            return Err(MemoryError::AlreadyExists);
        }
        self.carve(first, first + count);
        Ok(FrameRange::new(range))
    }

    fn mark(&mut self, range: PhysicalRange, used: bool) -> Result<(), MemoryError> {
        let (first, count) = frame_span(self.usable, range)?;
        for frame in first..first + count {
            let free = self.free_block_containing(frame).is_some();
            if used && free {
                self.carve(frame, frame + 1);
            } else if !used && !free {
                self.release(frame, frame + 1);
            }
        }
        Ok(())
    }

    fn usable(&self) -> PhysicalRange {
        self.usable
    }

    fn used_frames(&self) -> usize {
        self.frames - self.free_frames
    }
}
