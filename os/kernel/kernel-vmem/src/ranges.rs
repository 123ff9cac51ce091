//! Virtual-range bookkeeping for an address space.
//!
//! One bit per 4 KiB page of a managed window. Reserving pages only updates
//! the bitmap; backing them with frames is a separate mapping step.

use crate::{MapError, PageFlags};
use kernel_bitrange::{BitRange, BitRangeAlloc, ScanDirection};
use kernel_memory_addresses::{PageSize, Size4K, VirtualAddress, VirtualRange};

/// Pages reserved in a [`VirtualRangeAlloc`].
///
/// Move-only: the pages go back exactly once, through
/// [`VirtualRangeAlloc::release`], or are kept for good via
/// [`into_range`](Self::into_range).
#[must_use = "a reservation that is dropped can never be released"]
#[derive(Debug, PartialEq, Eq)]
pub struct VirtualReservation {
    range: VirtualRange,
}

impl VirtualReservation {
    #[inline]
    #[must_use]
    pub const fn range(&self) -> VirtualRange {
        self.range
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
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

    /// Keep the pages reserved permanently.
    #[inline]
    #[must_use]
    pub const fn into_range(self) -> VirtualRange {
        self.range
    }
}

/// Page-granular reservation of virtual ranges inside a fixed window.
pub struct VirtualRangeAlloc<'a> {
    window: VirtualRange,
    pages: BitRangeAlloc<'a>,
}

impl<'a> VirtualRangeAlloc<'a> {
    /// Words of bitmap storage needed to manage `window`.
    #[must_use]
    pub const fn storage_words(window: VirtualRange) -> usize {
        BitRangeAlloc::words_for(page_count(window))
    }

    /// Manage `window`, keeping the bitmap in `storage`.
    ///
    /// # Errors
    /// [`MapError::InvalidArgument`] if the window is empty or not page
    /// aligned, or if `storage` is too small.
    pub fn new(window: VirtualRange, storage: &'a mut [u64]) -> Result<Self, MapError> {
        if window.is_empty() || !window.is_page_aligned() {
            return Err(MapError::InvalidArgument("window must be non-empty and page aligned"));
        }
        if storage.len() < Self::storage_words(window) {
            return Err(MapError::InvalidArgument("range bitmap storage too small"));
        }

        Ok(Self {
            window,
            pages: BitRangeAlloc::new(storage, page_count(window)),
        })
    }

    #[inline]
    #[must_use]
    pub const fn window(&self) -> VirtualRange {
        self.window
    }

    #[inline]
    #[must_use]
    pub const fn reserved_pages(&self) -> usize {
        self.pages.used()
    }

    /// Reserve `pages` contiguous pages.
    ///
    /// With a `hint`, the lowest free run at or above the hint is taken, which
    /// is the hint itself whenever it is free. Without one, kernel requests
    /// (no `user` bit in `flags`) are placed near the top of the window and
    /// user requests near the bottom.
    ///
    /// # Errors
    /// - [`MapError::InvalidArgument`] for zero pages, or a hint that is
    ///   misaligned or outside the window.
    /// - [`MapError::OutOfMemory`] if no run of `pages` free pages exists.
    pub fn reserve(
        &mut self,
        hint: Option<VirtualAddress>,
        pages: usize,
        flags: PageFlags,
    ) -> Result<VirtualReservation, MapError> {
        if pages == 0 {
            return Err(MapError::InvalidArgument("zero-page reservation"));
        }

        let (start, direction) = match hint {
            Some(va) => {
                if !va.is_aligned_to(Size4K::SIZE) {
                    return Err(MapError::InvalidArgument("hint not page aligned"));
                }
                let Some(offset) = self.window.offset_of(va) else {
                    return Err(MapError::InvalidArgument("hint outside window"));
                };
                (page_index(offset), ScanDirection::Ascending)
            }
            None if flags.user() => (0, ScanDirection::Ascending),
            None => (self.pages.len() - 1, ScanDirection::Descending),
        };

        let Some(bits) = self.pages.alloc(pages, start, direction) else {
            log::warn!("no {pages} free pages in virtual window {:?}", self.window);
            return Err(MapError::OutOfMemory);
        };

        Ok(VirtualReservation {
            range: self.range_of(bits),
        })
    }

    /// Reserve exactly `range`.
    ///
    /// # Errors
    /// - [`MapError::InvalidArgument`] if `range` is misaligned or not inside
    ///   the window.
    /// - [`MapError::AlreadyExists`] if any page of it is already reserved.
    pub fn claim(&mut self, range: VirtualRange) -> Result<VirtualReservation, MapError> {
        let bits = self.bits_of(range)?;
        if !self.pages.all(bits, false) {
            return Err(MapError::AlreadyExists);
        }
        self.pages.set_range(bits, true);
        Ok(VirtualReservation { range })
    }

    /// Return reserved pages to the window.
    ///
    /// # Errors
    /// [`MapError::InvalidArgument`] if the reservation does not belong to
    /// this window or is not fully reserved here.
    pub fn release(&mut self, reservation: VirtualReservation) -> Result<(), MapError> {
        let bits = self.bits_of(reservation.range)?;
        if !self.pages.all(bits, true) {
            return Err(MapError::InvalidArgument("range is not reserved in this window"));
        }
        self.pages.free(bits);
        Ok(())
    }

    /// Whether every page of `range` is reserved.
    #[must_use]
    pub fn is_reserved(&self, range: VirtualRange) -> bool {
        self.bits_of(range).is_ok_and(|bits| self.pages.all(bits, true))
    }

    fn bits_of(&self, range: VirtualRange) -> Result<BitRange, MapError> {
        if !range.is_page_aligned() || !self.window.contains_range(range) {
            return Err(MapError::InvalidArgument("range outside window or misaligned"));
        }
        let start = page_index(range.base() - self.window.base());
        Ok(BitRange::new(start, page_index(range.len())))
    }

    fn range_of(&self, bits: BitRange) -> VirtualRange {
        VirtualRange::new(
            self.window.base() + bits.start as u64 * Size4K::SIZE,
            bits.len as u64 * Size4K::SIZE,
        )
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn page_count(window: VirtualRange) -> usize {
    (window.len() / Size4K::SIZE) as usize
}

#[allow(clippy::cast_possible_truncation)]
const fn page_index(bytes: u64) -> usize {
    (bytes / Size4K::SIZE) as usize
}
