//! Process-wide frame allocator and kernel address space.
//!
//! Both are installed exactly once during boot and live until the machine
//! stops. Code that can take them as parameters should; the accessors exist
//! for paths that cannot, such as interrupt handlers.

use crate::MemoryError;
use crate::frame::{KernelFrameAlloc, LockedFrameAlloc};
use crate::phys_mapper::DirectMapPhysMapper;
use kernel_sync::{SpinLock, SyncOnceCell};
use kernel_vmem::AddressSpace;
use log::info;

/// The kernel's frame allocator, whichever strategy was chosen.
pub type KernelFrames = LockedFrameAlloc<KernelFrameAlloc<'static>>;

/// The kernel address space, reached through the direct map.
pub type KernelSpace = SpinLock<AddressSpace<'static, DirectMapPhysMapper>>;

static FRAME_ALLOCATOR: SyncOnceCell<KernelFrames> = SyncOnceCell::new();
static KERNEL_SPACE: SyncOnceCell<KernelSpace> = SyncOnceCell::new();

/// Publish the frame allocator built by [`crate::boot::init_frame_allocator`].
///
/// # Errors
/// [`MemoryError::AlreadyExists`] if one is installed already.
pub fn install_frame_allocator(frames: KernelFrameAlloc<'static>) -> Result<&'static KernelFrames, MemoryError> {
    let strategy = frames.strategy();
    let installed = FRAME_ALLOCATOR
        .set(LockedFrameAlloc::new(frames))
        .map_err(|_| MemoryError::AlreadyExists)?;
    info!("frame allocator installed ({strategy:?})");
    Ok(installed)
}

/// The installed frame allocator.
///
/// # Panics
/// If called before [`install_frame_allocator`].
#[must_use]
pub fn frame_allocator() -> &'static KernelFrames {
    let Some(frames) = FRAME_ALLOCATOR.get() else {
        panic!("frame allocator used before it was installed");
    };
    frames
}

/// Publish the kernel address space built by [`crate::boot::init_kernel_space`].
///
/// # Errors
/// [`MemoryError::AlreadyExists`] if one is installed already.
pub fn install_kernel_space(
    space: AddressSpace<'static, DirectMapPhysMapper>,
) -> Result<&'static KernelSpace, MemoryError> {
    let installed = KERNEL_SPACE
        .set(SpinLock::new(space))
        .map_err(|_| MemoryError::AlreadyExists)?;
    info!("kernel address space installed");
    Ok(installed)
}

/// The installed kernel address space.
///
/// # Panics
/// If called before [`install_kernel_space`].
#[must_use]
pub fn kernel_space() -> &'static KernelSpace {
    let Some(space) = KERNEL_SPACE.get() else {
        panic!("kernel address space used before it was installed");
    };
    space
}
