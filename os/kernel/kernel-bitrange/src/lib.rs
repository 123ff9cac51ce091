//! # Bit-Range Allocator
//!
//! A bit vector in which a set bit means "in use", plus a search for runs of
//! clear bits. It is the bookkeeping primitive underneath every other
//! allocator in the memory subsystem:
//!
//! - the bitmap frame allocator (one bit per 4 KiB frame),
//! - the buddy frame allocator (one free map per order),
//! - virtual-range reservation in an address space (one bit per page),
//! - the slab arena and each slab's object map.
//!
//! The allocator never owns its storage. It borrows a `&mut [u64]` so the
//! words can live in frames carved out at boot or inside a descriptor.
//!
//! ## Scanning
//!
//! ```text
//! index:   0 1 2 3 4 5 6 7 8 9
//! bits:    1 1 0 0 0 1 0 0 0 0
//!
//! alloc(3, 0, Ascending)  -> [2, 5)   first run at or above `start`
//! alloc(3, 9, Descending) -> [7, 10)  highest run ending at or below `start`
//! ```
//!
//! A failed search leaves the bitmap untouched.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![forbid(unsafe_code)]

use core::fmt;

const WORD_BITS: usize = u64::BITS as usize;

/// A run of bits `[start, start + len)`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct BitRange {
    pub start: usize,
    pub len: usize,
}

impl BitRange {
    #[inline]
    #[must_use]
    pub const fn new(start: usize, len: usize) -> Self {
        Self { start, len }
    }

    /// Exclusive end index.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> usize {
        self.start + self.len
    }
}

/// Direction in which [`BitRangeAlloc::alloc`] walks away from its start index.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ScanDirection {
    /// Toward higher indices; yields the lowest fitting run at or above `start`.
    Ascending,
    /// Toward lower indices; yields the highest fitting run that ends at or
    /// below `start`. Used to place kernel allocations near the top.
    Descending,
}

pub struct BitRangeAlloc<'a> {
    words: &'a mut [u64],
    len: usize,
    used: usize,
}

impl<'a> BitRangeAlloc<'a> {
    /// Number of `u64` words needed to track `bits` bits.
    #[inline]
    #[must_use]
    pub const fn words_for(bits: usize) -> usize {
        bits.div_ceil(WORD_BITS)
    }

    /// Wrap `words` as an all-clear bitmap of `len` bits.
    ///
    /// # Panics
    /// If `words` cannot hold `len` bits.
    #[must_use]
    pub fn new(words: &'a mut [u64], len: usize) -> Self {
        assert!(
            words.len() >= Self::words_for(len),
            "bitmap storage too small: {} words for {len} bits",
            words.len()
        );
        words.fill(0);
        Self {
            words,
            len,
            used: 0,
        }
    }

    /// Wrap `words` keeping their current contents.
    ///
    /// Bits at or above `len` are cleared so they never count as used.
    ///
    /// # Panics
    /// If `words` cannot hold `len` bits.
    #[must_use]
    pub fn attach(words: &'a mut [u64], len: usize) -> Self {
        assert!(
            words.len() >= Self::words_for(len),
            "bitmap storage too small: {} words for {len} bits",
            words.len()
        );
        let full = len / WORD_BITS;
        if len % WORD_BITS != 0 {
            words[full] &= (1u64 << (len % WORD_BITS)) - 1;
        }
        let tail_start = Self::words_for(len);
        words[tail_start..].fill(0);
        let used = words.iter().map(|w| w.count_ones() as usize).sum();
        Self { words, len, used }
    }

    /// Number of bits tracked.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of set bits.
    #[inline]
    #[must_use]
    pub const fn used(&self) -> usize {
        self.used
    }

    /// Number of clear bits.
    #[inline]
    #[must_use]
    pub const fn available(&self) -> usize {
        self.len - self.used
    }

    /// # Panics
    /// If `index` is out of bounds.
    #[inline]
    #[must_use]
    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.len, "bit {index} out of bounds ({})", self.len);
        self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    /// # Panics
    /// If `index` is out of bounds.
    #[inline]
    pub fn set(&mut self, index: usize, value: bool) {
        assert!(index < self.len, "bit {index} out of bounds ({})", self.len);
        self.apply(index / WORD_BITS, 1 << (index % WORD_BITS), value);
    }

    /// Set or clear every bit of `range`.
    ///
    /// # Panics
    /// If `range` extends past the end of the bitmap.
    pub fn set_range(&mut self, range: BitRange, value: bool) {
        self.check_range(range);
        for (word, mask) in Masks::new(range) {
            self.apply(word, mask, value);
        }
    }

    /// Whether every bit of `range` equals `value`.
    ///
    /// # Panics
    /// If `range` extends past the end of the bitmap.
    #[must_use]
    pub fn all(&self, range: BitRange, value: bool) -> bool {
        self.check_range(range);
        Masks::new(range).all(|(word, mask)| {
            let bits = self.words[word] & mask;
            if value { bits == mask } else { bits == 0 }
        })
    }

    /// Find `count` consecutive clear bits, mark them used and return them.
    ///
    /// The search begins at `start` and walks in `direction`. For
    /// [`ScanDirection::Descending`] a `start` past the end is clamped to the
    /// last bit. Returns `None`, leaving the bitmap unchanged, if no such run
    /// exists or `count` is zero.
    pub fn alloc(&mut self, count: usize, start: usize, direction: ScanDirection) -> Option<BitRange> {
        let range = self.find_clear(count, start, direction)?;
        self.set_range(range, true);
        Some(range)
    }

    /// Clear a previously allocated run.
    ///
    /// # Panics
    /// If `range` extends past the end of the bitmap.
    pub fn free(&mut self, range: BitRange) {
        self.set_range(range, false);
    }

    /// Locate a run of `count` clear bits without claiming it.
    #[must_use]
    pub fn find_clear(&self, count: usize, start: usize, direction: ScanDirection) -> Option<BitRange> {
        if count == 0 || count > self.len {
            return None;
        }

        match direction {
            ScanDirection::Ascending => {
                let mut run = 0;
                let mut i = start;
                while i < self.len {
                    if i % WORD_BITS == 0 && self.words[i / WORD_BITS] == u64::MAX {
                        run = 0;
                        i += WORD_BITS;
                        continue;
                    }
                    if self.get(i) {
                        run = 0;
                    } else {
                        run += 1;
                        if run == count {
                            return Some(BitRange::new(i + 1 - count, count));
                        }
                    }
                    i += 1;
                }
                None
            }
            ScanDirection::Descending => {
                let mut run = 0;
                let mut i = start.min(self.len - 1);
                loop {
                    if i % WORD_BITS == WORD_BITS - 1 && self.words[i / WORD_BITS] == u64::MAX {
                        run = 0;
                        if i < WORD_BITS {
                            return None;
                        }
                        i -= WORD_BITS;
                        continue;
                    }
                    if self.get(i) {
                        run = 0;
                    } else {
                        run += 1;
                        if run == count {
                            return Some(BitRange::new(i, count));
                        }
                    }
                    if i == 0 {
                        return None;
                    }
                    i -= 1;
                }
            }
        }
    }

    /// Index of the nearest set bit starting at `from` (inclusive) and
    /// walking in `direction`.
    #[must_use]
    pub fn find_set(&self, from: usize, direction: ScanDirection) -> Option<usize> {
        if self.len == 0 {
            return None;
        }

        match direction {
            ScanDirection::Ascending => {
                if from >= self.len {
                    return None;
                }
                let mut word = from / WORD_BITS;
                let mut bits = self.words[word] & (u64::MAX << (from % WORD_BITS));
                loop {
                    if bits != 0 {
                        let index = word * WORD_BITS + bits.trailing_zeros() as usize;
                        return (index < self.len).then_some(index);
                    }
                    word += 1;
                    if word >= Self::words_for(self.len) {
                        return None;
                    }
                    bits = self.words[word];
                }
            }
            ScanDirection::Descending => {
                let from = from.min(self.len - 1);
                let mut word = from / WORD_BITS;
                let shift = WORD_BITS - 1 - from % WORD_BITS;
                let mut bits = self.words[word] & (u64::MAX >> shift);
                loop {
                    if bits != 0 {
                        return Some(word * WORD_BITS + (WORD_BITS - 1 - bits.leading_zeros() as usize));
                    }
                    if word == 0 {
                        return None;
                    }
                    word -= 1;
                    bits = self.words[word];
                }
            }
        }
    }

    #[inline]
    fn apply(&mut self, word: usize, mask: u64, value: bool) {
        let before = (self.words[word] & mask).count_ones() as usize;
        if value {
            self.words[word] |= mask;
            self.used += mask.count_ones() as usize - before;
        } else {
            self.words[word] &= !mask;
            self.used -= before;
        }
    }

    #[inline]
    fn check_range(&self, range: BitRange) {
        assert!(
            range.end() <= self.len,
            "bit range {}..{} out of bounds ({})",
            range.start,
            range.end(),
            self.len
        );
    }
}

impl fmt::Debug for BitRangeAlloc<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitRangeAlloc")
            .field("len", &self.len)
            .field("used", &self.used)
            .finish_non_exhaustive()
    }
}

/// Per-word masks covering a bit range.
struct Masks {
    next: usize,
    end: usize,
}

impl Masks {
    const fn new(range: BitRange) -> Self {
        Self {
            next: range.start,
            end: range.end(),
        }
    }
}

impl Iterator for Masks {
    type Item = (usize, u64);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let word = self.next / WORD_BITS;
        let lo = self.next % WORD_BITS;
        let hi = (self.end - word * WORD_BITS).min(WORD_BITS);
        let width = hi - lo;
        let mask = if width == WORD_BITS {
            u64::MAX
        } else {
            ((1u64 << width) - 1) << lo
        };
        self.next = (word + 1) * WORD_BITS;
        Some((word, mask))
    }
}
