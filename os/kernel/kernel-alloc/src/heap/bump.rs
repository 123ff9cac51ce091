use super::{HeapAllocator, PageSource, check_request};
use crate::{AllocHints, MemoryError};
use kernel_memory_addresses::{PageSize, Size4K, VirtualAddress, VirtualRange, align_up};
use kernel_sync::SpinLock;
use log::{trace, warn};

/// Bootstrap heap: hands out consecutive bytes of one growing range.
///
/// The range starts empty at the bottom of its window. When a request does
/// not fit the unused tail, the heap backs just enough whole pages directly
/// past the range, in one step. Nothing is ever reclaimed.
pub struct BumpHeap<P: PageSource> {
    source: P,
    state: SpinLock<BumpState>,
}

struct BumpState {
    window: VirtualRange,
    /// Bytes backed from the window base.
    backed: u64,
    /// Bytes handed out from the window base.
    cursor: u64,
}

impl<P: PageSource> BumpHeap<P> {
    /// # Errors
    /// [`MemoryError::InvalidArgument`] for an empty or misaligned window.
    pub fn new(source: P, window: VirtualRange) -> Result<Self, MemoryError> {
        if window.is_empty() || !window.is_page_aligned() {
            return Err(MemoryError::InvalidArgument("heap window empty or not page aligned"));
        }
        Ok(Self {
            source,
            state: SpinLock::new(BumpState {
                window,
                backed: 0,
                cursor: 0,
            }),
        })
    }

    /// The range backed so far.
    #[must_use]
    pub fn range(&self) -> VirtualRange {
        let state = self.state.lock();
        VirtualRange::new(state.window.base(), state.backed)
    }

    /// Bytes handed out so far, including alignment padding.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.state.lock().cursor
    }

    #[must_use]
    pub const fn source(&self) -> &P {
        &self.source
    }
}

impl<P: PageSource> HeapAllocator for BumpHeap<P> {
    fn alloc_aligned(&self, size: usize, align: usize, hints: AllocHints) -> Result<VirtualRange, MemoryError> {
        let (size, align) = check_request(size, align)?;
        let mut state = if hints.atomic() {
            self.state.lock_irq()
        } else {
            self.state.lock()
        };

        let base = state.window.base().as_u64();
        let start = (base + state.cursor)
            .checked_next_multiple_of(align)
            .ok_or(MemoryError::OutOfMemory)?
            - base;
        let end = start.checked_add(size).ok_or(MemoryError::OutOfMemory)?;

        if end > state.backed {
            let grow = align_up(end - state.backed, Size4K::SIZE);
            if state.backed + grow > state.window.len() {
                warn!("bump heap window {:?} exhausted", state.window);
                return Err(MemoryError::OutOfMemory);
            }
            self.source
                .back(VirtualRange::new(state.window.base() + state.backed, grow))?;
            state.backed += grow;
            trace!("bump heap grew by {grow:#x} to {:#x}", state.backed);
        }

        state.cursor = end;
        Ok(VirtualRange::new(VirtualAddress::new(base + start), size))
    }

    fn free(&self, _address: VirtualAddress) -> Result<(), MemoryError> {
        Err(MemoryError::NotImplemented)
    }
}
