//! Runtime policy of the memory subsystem, fixed at boot.

use crate::MemoryError;
use crate::frame::FrameStrategy;
use kernel_info::memory::{KERNEL_HEAP_BASE, KERNEL_HEAP_SIZE, PAGE_SIZE};
use kernel_memory_addresses::{VirtualAddress, VirtualRange};

/// 64 MiB of slab pages by default.
pub const DEFAULT_SLAB_WINDOW_SIZE: u64 = 64 * 1024 * 1024;

/// 256 MiB of bump heap by default.
pub const DEFAULT_BUMP_WINDOW_SIZE: u64 = 256 * 1024 * 1024;

/// Which allocators the kernel uses and how the heap window is split.
///
/// The kernel-heap window is divided into three disjoint parts, bottom up:
/// slab pages, the bump heap, and the window handed to the address space's
/// range allocator for [`reserve`](kernel_vmem::AddressSpace::reserve).
/// Each heap grows by mapping pages directly, so neither may share its
/// window with the range allocator.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryConfig {
    frame_strategy: FrameStrategy,
    slab_window_size: u64,
    bump_window_size: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            frame_strategy: FrameStrategy::Bitmap,
            slab_window_size: DEFAULT_SLAB_WINDOW_SIZE,
            bump_window_size: DEFAULT_BUMP_WINDOW_SIZE,
        }
    }

    #[must_use]
    pub const fn with_frame_strategy(mut self, strategy: FrameStrategy) -> Self {
        self.frame_strategy = strategy;
        self
    }

    #[must_use]
    pub const fn with_slab_window_size(mut self, size: u64) -> Self {
        self.slab_window_size = size;
        self
    }

    #[must_use]
    pub const fn with_bump_window_size(mut self, size: u64) -> Self {
        self.bump_window_size = size;
        self
    }

    #[must_use]
    pub const fn frame_strategy(&self) -> FrameStrategy {
        self.frame_strategy
    }

    #[must_use]
    pub const fn slab_window_size(&self) -> u64 {
        self.slab_window_size
    }

    #[must_use]
    pub const fn bump_window_size(&self) -> u64 {
        self.bump_window_size
    }

    /// Where slab pages live.
    #[must_use]
    pub const fn slab_window(&self) -> VirtualRange {
        VirtualRange::new(VirtualAddress::new(KERNEL_HEAP_BASE), self.slab_window_size)
    }

    /// Where the bump heap grows, right above the slab window.
    #[must_use]
    pub const fn bump_window(&self) -> VirtualRange {
        VirtualRange::new(
            VirtualAddress::new(KERNEL_HEAP_BASE + self.slab_window_size),
            self.bump_window_size,
        )
    }

    /// What is left of the heap window above the bump heap, for
    /// [`init_virtual_ranges`](crate::boot::init_virtual_ranges).
    #[must_use]
    pub const fn reserve_window(&self) -> VirtualRange {
        let used = self.slab_window_size.saturating_add(self.bump_window_size);
        VirtualRange::new(
            VirtualAddress::new(KERNEL_HEAP_BASE + used),
            KERNEL_HEAP_SIZE.saturating_sub(used),
        )
    }

    /// # Errors
    /// [`MemoryError::InvalidArgument`] unless both heap windows are a
    /// non-zero number of pages and leave room for reservations.
    pub const fn validate(&self) -> Result<(), MemoryError> {
        if self.slab_window_size == 0 || !self.slab_window_size.is_multiple_of(PAGE_SIZE) {
            return Err(MemoryError::InvalidArgument("slab window must be whole pages"));
        }
        if self.bump_window_size == 0 || !self.bump_window_size.is_multiple_of(PAGE_SIZE) {
            return Err(MemoryError::InvalidArgument("bump window must be whole pages"));
        }
        match self.slab_window_size.checked_add(self.bump_window_size) {
            Some(used) if used < KERNEL_HEAP_SIZE => Ok(()),
            _ => Err(MemoryError::InvalidArgument("heap windows fill the heap window")),
        }
    }
}
