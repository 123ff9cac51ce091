//! The process-wide allocators can be installed once and only once.

use kernel_alloc::global::{frame_allocator, install_frame_allocator, install_kernel_space, kernel_space};
use kernel_alloc::{AllocHints, DirectMapPhysMapper, FrameStrategy, KernelFrameAlloc, MemoryError};
use kernel_info::memory::KERNEL_HEAP_BASE;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, PhysicalRange, VirtualAddress, VirtualRange};
use kernel_vmem::{AddressSpace, VirtualRangeAlloc};
use std::panic::catch_unwind;

static MAPPER: DirectMapPhysMapper = DirectMapPhysMapper;

fn frames() -> KernelFrameAlloc<'static> {
    let usable = PhysicalRange::new(PhysicalAddress::new(0x10_0000), 16 * 1024 * 1024);
    let words = KernelFrameAlloc::storage_words(FrameStrategy::Bitmap, usable);
    let storage = Box::leak(vec![0u64; words].into_boxed_slice());
    KernelFrameAlloc::new(FrameStrategy::Bitmap, usable, storage).unwrap()
}

fn space() -> AddressSpace<'static, DirectMapPhysMapper> {
    let window = VirtualRange::new(VirtualAddress::new(KERNEL_HEAP_BASE), 64 * 4096);
    let storage = Box::leak(vec![0u64; VirtualRangeAlloc::storage_words(window)].into_boxed_slice());
    let ranges = VirtualRangeAlloc::new(window, storage).unwrap();
    let root = PhysicalPage::containing(PhysicalAddress::new(0x20_0000));
    AddressSpace::from_root(&MAPPER, root, ranges)
}

#[test]
fn allocators_are_installed_exactly_once() {
    assert!(catch_unwind(frame_allocator).is_err());
    assert!(catch_unwind(kernel_space).is_err());

    let installed = install_frame_allocator(frames()).unwrap();
    assert!(core::ptr::eq(installed, frame_allocator()));
    let frame = frame_allocator().alloc(4096, AllocHints::KERNEL).unwrap();
    assert_eq!(frame_allocator().used_frames(), 1);
    frame_allocator().free(frame).unwrap();
    assert!(matches!(
        install_frame_allocator(frames()),
        Err(MemoryError::AlreadyExists)
    ));

    install_kernel_space(space()).unwrap();
    assert_eq!(
        kernel_space().lock().root_page(),
        PhysicalPage::containing(PhysicalAddress::new(0x20_0000))
    );
    assert!(matches!(install_kernel_space(space()), Err(MemoryError::AlreadyExists)));
}
