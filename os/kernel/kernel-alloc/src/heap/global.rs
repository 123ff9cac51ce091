use super::HeapAllocator;
use crate::{AllocHints, MemoryError};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::null_mut;
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::SyncOnceCell;
use log::warn;

/// Adapter that serves `alloc::` collections from a [`HeapAllocator`].
///
/// The heap is installed once, after the frame allocator and kernel address
/// space exist. Until then every allocation fails with a null pointer.
///
/// ```ignore
/// #[global_allocator]
/// static HEAP: KernelHeap<SlabHeap<KernelPageSource<'static, 'static, DirectMapPhysMapper, KernelFrameAlloc<'static>>>> =
///     KernelHeap::new();
/// ```
pub struct KernelHeap<H> {
    heap: SyncOnceCell<H>,
}

impl<H> Default for KernelHeap<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> KernelHeap<H> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            heap: SyncOnceCell::new(),
        }
    }

    /// Start serving allocations from `heap`.
    ///
    /// # Errors
    /// [`MemoryError::AlreadyExists`] if a heap is installed already.
    pub fn install(&self, heap: H) -> Result<&H, MemoryError> {
        self.heap.set(heap).map_err(|_| MemoryError::AlreadyExists)
    }

    #[must_use]
    pub fn get(&self) -> Option<&H> {
        self.heap.get()
    }
}

// SAFETY: every pointer handed out comes from the heap's own bookkeeping,
// sized and aligned as `layout` demands.
unsafe impl<H: HeapAllocator> GlobalAlloc for KernelHeap<H> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let Some(heap) = self.heap.get() else {
            warn!("allocation of {} bytes before the heap exists", layout.size());
            return null_mut();
        };
        match heap.alloc_aligned(layout.size(), layout.align(), AllocHints::KERNEL) {
            Ok(range) => range.base().as_mut_ptr(),
            Err(e) => {
                warn!("heap allocation of {layout:?} failed: {e}");
                null_mut()
            }
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let Some(heap) = self.heap.get() else {
            return;
        };
        if let Err(e) = heap.free(VirtualAddress::from_ptr(ptr)) {
            warn!("heap free of {layout:?} at {ptr:p} failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::test_support::HostPages;
    use crate::heap::{BumpHeap, SlabHeap};

    #[test]
    fn nothing_is_served_before_install() {
        let global: KernelHeap<SlabHeap<HostPages>> = KernelHeap::new();
        let layout = Layout::from_size_align(16, 8).unwrap();
        assert!(unsafe { global.alloc(layout) }.is_null());
        assert!(global.get().is_none());
    }

    #[test]
    fn installed_slab_heap_serves_writable_memory() {
        let source = HostPages::with_window(8);
        let window = source.window();
        let global = KernelHeap::new();
        global.install(SlabHeap::new(source, window).unwrap()).unwrap();

        let layout = Layout::from_size_align(48, 16).unwrap();
        let p = unsafe { global.alloc(layout) };
        assert!(!p.is_null());
        assert!(p.addr().is_multiple_of(16));
        unsafe {
            p.write_bytes(0xAB, 48);
            assert_eq!(*p.add(47), 0xAB);
        }

        let zeroed = unsafe { global.alloc_zeroed(layout) };
        assert!(!zeroed.is_null() && zeroed != p);
        assert!((0..48).all(|i| unsafe { *zeroed.add(i) } == 0));

        unsafe {
            global.dealloc(p, layout);
            global.dealloc(zeroed, layout);
        }
        let heap = global.get().unwrap();
        assert_eq!(heap.slab_info(VirtualAddress::from_ptr(p)).unwrap().in_use, 0);
    }

    #[test]
    fn second_install_is_refused() {
        let global = KernelHeap::new();
        let window = HostPages::with_window(1);
        let range = window.window();
        global.install(BumpHeap::new(window, range).unwrap()).unwrap();

        let other = HostPages::with_window(1);
        let range = other.window();
        assert!(matches!(
            global.install(BumpHeap::new(other, range).unwrap()),
            Err(MemoryError::AlreadyExists)
        ));
    }
}
