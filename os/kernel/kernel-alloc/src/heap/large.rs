use crate::MemoryError;
use kernel_memory_addresses::{VirtualAddress, VirtualRange};

/// Number of large allocations a slab heap can track at once.
pub const LARGE_SLOTS: usize = 128;

/// Side table of the large allocations a heap handed out, so that `free`
/// can recover their length from the address alone.
pub struct LargeTable {
    slots: [Option<VirtualRange>; LARGE_SLOTS],
}

impl LargeTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [None; LARGE_SLOTS],
        }
    }

    /// # Errors
    /// [`MemoryError::OutOfMemory`] if every slot is taken.
    pub fn insert(&mut self, range: VirtualRange) -> Result<(), MemoryError> {
        let Some(slot) = self.slots.iter_mut().find(|s| s.is_none()) else {
            return Err(MemoryError::OutOfMemory);
        };
        *slot = Some(range);
        Ok(())
    }

    /// Forget the allocation starting at `base` and return it.
    pub fn remove(&mut self, base: VirtualAddress) -> Option<VirtualRange> {
        self.slots
            .iter_mut()
            .find(|s| s.is_some_and(|r| r.base() == base))
            .and_then(Option::take)
    }

    /// Forget every allocation, yielding each once.
    pub fn drain(&mut self) -> impl Iterator<Item = VirtualRange> + '_ {
        self.slots.iter_mut().filter_map(Option::take)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(base: u64) -> VirtualRange {
        VirtualRange::new(VirtualAddress::new(base), 0x3000)
    }

    #[test]
    fn entries_are_found_by_base_only() {
        let mut table = LargeTable::new();
        assert!(table.is_empty());
        table.insert(range(0x1000)).unwrap();
        table.insert(range(0x9000)).unwrap();
        assert_eq!(table.len(), 2);
        assert!(!table.is_empty());

        assert_eq!(table.remove(VirtualAddress::new(0x2000)), None);
        assert_eq!(table.remove(VirtualAddress::new(0x9000)), Some(range(0x9000)));
        assert_eq!(table.remove(VirtualAddress::new(0x9000)), None);
        assert_eq!(table.len(), 1);

        assert_eq!(table.drain().collect::<Vec<_>>(), [range(0x1000)]);
        assert!(table.is_empty());
    }

    #[test]
    fn a_full_table_refuses_more() {
        let mut table = LargeTable::new();
        for i in 0..LARGE_SLOTS as u64 {
            table.insert(range(i << 16)).unwrap();
        }
        assert_eq!(table.insert(range(u64::MAX << 16)), Err(MemoryError::OutOfMemory));
        assert!(table.remove(VirtualAddress::new(0)).is_some());
        table.insert(range(u64::MAX << 16)).unwrap();
    }
}
