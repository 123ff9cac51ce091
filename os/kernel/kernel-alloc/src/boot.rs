//! # Boot-Time Construction
//!
//! Brings the memory subsystem up in order:
//!
//! 1. [`check_cpu_support`] refuses processors without long mode or NX.
//! 2. [`init_frame_allocator`] picks the largest usable span of the boot
//!    memory map and places the allocator's own storage at its start.
//! 3. [`init_virtual_ranges`] allocates the bookkeeping for a virtual window,
//!    normally [`MemoryConfig::reserve_window`](crate::MemoryConfig::reserve_window)
//!    so reservations never land in a heap window.
//! 4. [`init_kernel_space`] builds the kernel address space and seeds its
//!    fixed windows.
//!
//! Heaps are created afterwards, on top of the installed singletons.

use crate::frame::{FrameAllocator, FrameStrategy, KernelFrameAlloc, LockedFrameAlloc, TableFrames};
use crate::{AllocHints, MemoryError};
use kernel_info::boot::{MemoryRegion, largest_usable_span};
use kernel_info::memory::MIN_USABLE_SPAN;
use kernel_memory_addresses::{PageSize, PhysicalRange, Size4K, VirtualRange, align_up};
use kernel_registers::cpuid::Leaf80000001Edx;
use kernel_vmem::{AddressSpace, KernelLayout, PhysMapper, VirtualRangeAlloc};
use log::{info, warn};

/// Fail unless the processor supports what paging relies on.
///
/// # Errors
/// [`MemoryError::Unsupported`] without long mode or the NX bit.
pub fn check_cpu_support() -> Result<(), MemoryError> {
    let Some(features) = Leaf80000001Edx::read() else {
        return Err(MemoryError::Unsupported("extended CPUID leaf missing"));
    };
    check_features(features)
}

fn check_features(features: Leaf80000001Edx) -> Result<(), MemoryError> {
    if !features.long_mode() {
        return Err(MemoryError::Unsupported("long mode"));
    }
    if !features.nx() {
        return Err(MemoryError::Unsupported("no-execute pages"));
    }
    if !features.page1gb() {
        info!("1 GiB pages not supported");
    }
    Ok(())
}

/// Build the frame allocator over the largest usable span of `regions`.
///
/// The allocator's storage is placed at the start of the span and taken out
/// of the pool, so the returned allocator already counts it as used.
///
/// # Errors
/// - [`MemoryError::OutOfMemory`] if no usable span of at least
///   [`MIN_USABLE_SPAN`] bytes exists.
/// - [`MemoryError::InvalidArgument`] if the storage does not fit the span.
///
/// # Safety
/// - The usable span must be unused RAM, mapped writable through `mapper`
///   for `'a`.
/// - No other code may use that memory for `'a`.
pub unsafe fn init_frame_allocator<'a, M: PhysMapper>(
    regions: &[MemoryRegion],
    mapper: &M,
    strategy: FrameStrategy,
) -> Result<KernelFrameAlloc<'a>, MemoryError> {
    let Some(usable) = largest_usable_span(regions) else {
        warn!("boot memory map has no usable memory");
        return Err(MemoryError::OutOfMemory);
    };
    if usable.len() < MIN_USABLE_SPAN {
        warn!("largest usable span {usable:?} is below {MIN_USABLE_SPAN:#x} bytes");
        return Err(MemoryError::OutOfMemory);
    }

    let words = KernelFrameAlloc::storage_words(strategy, usable);
    let bytes = align_up(words as u64 * 8, Size4K::SIZE);
    if bytes >= usable.len() {
        return Err(MemoryError::InvalidArgument("allocator storage exceeds the usable span"));
    }
    let storage_range = PhysicalRange::new(usable.base(), bytes);

    // SAFETY: the caller hands the whole span over; the storage pages are
    // removed from the pool right below.
    let storage = unsafe { carve_words(mapper, storage_range) };
    let mut frames = KernelFrameAlloc::new(strategy, usable, storage)?;
    let _storage = frames.take(storage_range)?.into_raw();

    info!(
        "frame allocator ({strategy:?}) over {usable:?}: {} frames, storage {:#x} bytes",
        usable.pages(),
        bytes
    );
    Ok(frames)
}

/// Allocate the page bitmap of `window` from `frames` and wrap it.
///
/// The storage frames stay allocated for good.
///
/// # Errors
/// - [`MemoryError::OutOfMemory`] if the frames cannot be allocated.
/// - [`MemoryError::InvalidArgument`] for an empty or misaligned window.
///
/// # Safety
/// Frames from `frames` must be mapped writable through `mapper` for `'a`.
pub unsafe fn init_virtual_ranges<'a, M: PhysMapper, A: FrameAllocator>(
    mapper: &M,
    frames: &LockedFrameAlloc<A>,
    window: VirtualRange,
) -> Result<VirtualRangeAlloc<'a>, MemoryError> {
    let words = VirtualRangeAlloc::storage_words(window);
    let storage_range = frames.alloc(words as u64 * 8, AllocHints::KERNEL)?.into_raw();

    // SAFETY: the frames were just allocated and are never given back.
    let storage = unsafe { carve_words(mapper, storage_range) };
    Ok(VirtualRangeAlloc::new(window, storage)?)
}

/// Create the kernel address space and seed its fixed windows.
///
/// Page tables come from `frames`. The space is not activated.
///
/// # Errors
/// See [`AddressSpace::new`] and [`AddressSpace::init_kernel_windows`].
pub fn init_kernel_space<'m, M: PhysMapper, A: FrameAllocator>(
    mapper: &'m M,
    frames: &LockedFrameAlloc<A>,
    layout: &KernelLayout,
    ranges: VirtualRangeAlloc<'m>,
) -> Result<AddressSpace<'m, M>, MemoryError> {
    let mut tables = TableFrames(frames);
    let mut space = AddressSpace::new(mapper, &mut tables, ranges)?;
    space.init_kernel_windows(&mut tables, layout)?;
    info!("kernel address space ready, root at {}", space.root_page().base());
    Ok(space)
}

/// View `range` as a slice of words.
///
/// # Safety
/// `range` must be mapped writable through `mapper`, 8-byte aligned, and not
/// be used by anything else for `'a`.
unsafe fn carve_words<'a, M: PhysMapper>(mapper: &M, range: PhysicalRange) -> &'a mut [u64] {
    #[allow(clippy::cast_possible_truncation)]
    let len = (range.len() / 8) as usize;
    let ptr = mapper.phys_to_virt(range.base()).as_mut_ptr::<u64>();
    unsafe { core::slice::from_raw_parts_mut(ptr, len) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_features_are_checked() {
        let full = Leaf80000001Edx::new().with_long_mode(true).with_nx(true);
        assert_eq!(check_features(full), Ok(()));
        assert_eq!(check_features(full.with_page1gb(true)), Ok(()));
        assert_eq!(
            check_features(full.with_nx(false)),
            Err(MemoryError::Unsupported("no-execute pages"))
        );
        assert_eq!(
            check_features(Leaf80000001Edx::new().with_nx(true)),
            Err(MemoryError::Unsupported("long mode"))
        );
    }
}
