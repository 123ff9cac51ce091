use super::PageSource;
use crate::MemoryError;
use kernel_memory_addresses::{PageSize, Size4K, VirtualAddress, VirtualRange};
use std::sync::Mutex;

#[repr(C, align(4096))]
#[derive(Clone)]
pub struct Page(#[allow(dead_code)] [u8; 4096]);

fn pages(n: usize) -> Box<[Page]> {
    vec![Page([0; 4096]); n].into_boxed_slice()
}

fn range_of(block: &[Page]) -> VirtualRange {
    VirtualRange::new(VirtualAddress::from_ptr(block.as_ptr()), block.len() as u64 * Size4K::SIZE)
}

/// Host memory standing in for frames and page tables.
///
/// `back` and `unback` only record what they were asked; with
/// [`window`](Self::window) the heap window itself is real memory, so
/// objects can be written through.
#[derive(Default)]
pub struct HostPages {
    pub backed: Mutex<Vec<VirtualRange>>,
    pub unbacked: Mutex<Vec<VirtualRange>>,
    direct: Mutex<Vec<Box<[Page]>>>,
    window: Option<Box<[Page]>>,
    /// Pages `back` may still hand out; unlimited if `None`.
    pub budget: Mutex<Option<u64>>,
}

impl HostPages {
    pub fn new() -> Self {
        Self::default()
    }

    /// A source whose heap window of `n` pages is writable host memory.
    pub fn with_window(n: usize) -> Self {
        Self {
            window: Some(pages(n)),
            ..Self::default()
        }
    }

    pub fn window(&self) -> VirtualRange {
        range_of(self.window.as_deref().expect("source without a window"))
    }

    pub fn with_budget(self, pages: u64) -> Self {
        *self.budget.lock().unwrap() = Some(pages);
        self
    }

    pub fn backed_bytes(&self) -> u64 {
        self.backed.lock().unwrap().iter().map(|r| r.len()).sum::<u64>()
            - self.unbacked.lock().unwrap().iter().map(|r| r.len()).sum::<u64>()
    }

    pub fn direct_blocks(&self) -> usize {
        self.direct.lock().unwrap().len()
    }
}

unsafe impl PageSource for HostPages {
    fn back(&self, range: VirtualRange) -> Result<(), MemoryError> {
        let mut budget = self.budget.lock().unwrap();
        if let Some(left) = budget.as_mut() {
            *left = left.checked_sub(range.pages()).ok_or(MemoryError::OutOfMemory)?;
        }
        self.backed.lock().unwrap().push(range);
        Ok(())
    }

    fn unback(&self, range: VirtualRange) -> Result<(), MemoryError> {
        self.unbacked.lock().unwrap().push(range);
        Ok(())
    }

    fn alloc_direct(&self, len: u64) -> Result<VirtualRange, MemoryError> {
        if len == 0 {
            return Err(MemoryError::InvalidArgument("zero-length direct allocation"));
        }
        let block = pages(usize::try_from(len.div_ceil(Size4K::SIZE)).unwrap());
        let range = range_of(&block);
        self.direct.lock().unwrap().push(block);
        Ok(range)
    }

    fn free_direct(&self, range: VirtualRange) -> Result<(), MemoryError> {
        let mut direct = self.direct.lock().unwrap();
        let Some(i) = direct.iter().position(|b| range_of(b) == range) else {
            return Err(MemoryError::InvalidArgument("not a direct block"));
        };
        direct.swap_remove(i);
        Ok(())
    }
}
